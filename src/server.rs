//! Process wiring: builds the relay's collaborators and runs them.

use crate::catalog::CatalogRepository;
use crate::config::{ConfigContext, ServeArgs, SubmitArgs};
use crate::db::DbHandle;
use crate::fetch::HttpFetcher;
use crate::publisher::Publisher;
use crate::storage::S3Store;
use crate::transcode::Transcoder;
use crate::worker::Worker;
use crate::NewCatalogRecord;
use anyhow::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Runs the processing worker until `cancel_token` is cancelled.
pub async fn serve(
    cancel_token: CancellationToken,
    config: &ConfigContext,
    args: &ServeArgs,
) -> Result<(), Error> {
    let db = DbHandle::new(&config.connect_url, config.max_connections).await?;
    db.ping().await?;
    info!("Connected to PostgreSQL");

    let queue = config.pg_queue(db.clone());
    queue.recover().await?;

    let store = S3Store::new(args.s3_config()).await;
    if let Err(err) = store.health_check().await {
        warn!(bucket = %store.config().bucket, error = %err, "S3 bucket is not reachable yet");
    }

    let fetcher = HttpFetcher::new(args.fetch_timeout())?;

    let worker = Worker::new(
        Arc::new(queue),
        Arc::new(fetcher),
        Arc::new(store),
        Arc::new(db),
        Transcoder::default(),
        args.worker_config(),
    );
    let handle = worker.start(&cancel_token);
    info!(queue = %config.queue, "Waiting for messages");

    cancel_token.cancelled().await;
    debug!("Server Cancelled");

    handle.stop().await?;
    info!("Server stopped.");

    Ok(())
}

/// Creates a catalog record and publishes its processing request, the way the
/// catalog write path does.
pub async fn submit(config: &ConfigContext, args: &SubmitArgs) -> Result<i64, Error> {
    let db = DbHandle::new(&config.connect_url, config.max_connections).await?;

    let record = NewCatalogRecord {
        owner_id: args.owner_id,
        name: args.name.clone(),
        description: args.description.clone(),
        price: args.price,
        source_images: args.images.clone(),
    };
    let record_id = db.insert(&record).await?;
    info!(record_id, "Created catalog record");

    let publisher = Publisher::new(Arc::new(config.pg_queue(db)));
    publisher
        .publish_processing_request(record_id, record.owner_id, record.source_images)
        .await;

    Ok(record_id)
}
