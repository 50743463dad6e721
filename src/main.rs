use anyhow::Error;
use clap::Parser;
use std::env;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use image_relay::config::{Command, ConfigContext};
use image_relay::{server, telemetry};

async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    match &config.command {
        Command::Serve(args) => {
            server::serve(cancel_token, &config, args)
                .instrument(info_span!("server"))
                .await
        }
        Command::Submit(args) => {
            let record_id = server::submit(&config, args).await?;
            println!("{record_id}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "image_relay=DEBUG");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        token.cancel();
    });

    let result = app.await?;
    if let Err(err) = &result {
        error!(error = %err, "Exiting with error");
    }
    info!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
