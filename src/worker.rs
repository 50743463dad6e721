//! The image processing relay.
//!
//! One long-lived loop pulls one message at a time and drives it through
//! `Received -> Parsed -> ImagesProcessed -> CatalogUpdated -> Acknowledged`.
//!
//! Failure policy:
//! - malformed body: removed from the queue, never retried
//! - per-image failure (download, decode, encode, storage): image skipped,
//!   the rest of the batch continues
//! - catalog read or write failure: message requeued for redelivery
//!
//! The message is acknowledged only after the catalog update commits.

use crate::catalog::CatalogRepository;
use crate::error::{ImageError, ParseError, RepositoryError};
use crate::fetch::ImageFetcher;
use crate::queue::{Delivery, MessageQueue};
use crate::storage::{object_key, ObjectStore, UniqueSuffix};
use crate::transcode::{SourceFormat, Transcoder};
use crate::ProcessingRequest;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Wait between polls of an empty queue, after queue errors and after a
    /// requeue
    pub poll_interval: Duration,
    /// Images of one message processed concurrently; output order is kept
    pub image_concurrency: usize,
    /// Limit on the catalog read-modify-write; expiry requeues the message
    pub catalog_timeout: Option<Duration>,
    /// Discard messages delivered more often than this
    pub max_deliveries: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            image_concurrency: 1,
            catalog_timeout: None,
            max_deliveries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Parsed,
    ImagesProcessed,
    CatalogUpdated,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; removed from the queue.
    Acknowledged,
    /// Can never succeed; removed from the queue without processing.
    Discarded,
    /// Handed back to the queue for redelivery.
    Requeued,
}

#[derive(Debug)]
pub enum ImageOutcome {
    Stored { image_ref: String, locator: String },
    Failed { image_ref: String, error: ImageError },
}

impl ImageOutcome {
    pub fn image_ref(&self) -> &str {
        match self {
            ImageOutcome::Stored { image_ref, .. } | ImageOutcome::Failed { image_ref, .. } => {
                image_ref
            }
        }
    }

    pub fn locator(&self) -> Option<&str> {
        match self {
            ImageOutcome::Stored { locator, .. } => Some(locator),
            ImageOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageFailure {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("message delivered {0} times")]
    TooManyDeliveries(u32),
}

/// What happened to one delivery.
#[derive(Debug)]
pub struct MessageReport {
    /// Last stage reached
    pub stage: Stage,
    pub disposition: Disposition,
    pub images: Vec<ImageOutcome>,
    pub failure: Option<MessageFailure>,
    /// Whether the queue accepted the ack or nack
    pub settled: bool,
}

impl MessageReport {
    fn received() -> Self {
        Self {
            stage: Stage::Received,
            disposition: Disposition::Requeued,
            images: Vec::new(),
            failure: None,
            settled: false,
        }
    }

    /// Locators of the stored images, in request order.
    pub fn locators(&self) -> Vec<String> {
        self.images
            .iter()
            .filter_map(|outcome| outcome.locator().map(str::to_string))
            .collect()
    }
}

pub struct Worker {
    queue: Arc<dyn MessageQueue>,
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn CatalogRepository>,
    transcoder: Arc<Transcoder>,
    suffix: UniqueSuffix,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn CatalogRepository>,
        transcoder: Transcoder,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            fetcher,
            store,
            catalog,
            transcoder: Arc::new(transcoder),
            suffix: UniqueSuffix::new(),
            config,
        }
    }

    /// Spawns the consume loop under a child of `cancel_token`.
    pub fn start(self, cancel_token: &CancellationToken) -> WorkerHandle {
        let cancel_token = cancel_token.child_token();
        let worker = Arc::new(self);
        let join_handle = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(
                async move {
                    worker.run(cancel_token).await;
                }
                .instrument(info_span!("worker")),
            )
        };
        WorkerHandle {
            cancel_token,
            join_handle,
        }
    }

    /// Consumes messages until cancelled.
    ///
    /// Cancellation is observed between messages; a message already received
    /// is processed and settled first.
    pub async fn run(&self, cancel_token: CancellationToken) {
        info!("Worker started");
        while !cancel_token.is_cancelled() {
            match self.queue.receive().await {
                Ok(Some(delivery)) => {
                    let report = self.handle_delivery(delivery).await;
                    // Let other messages through before the requeued one comes back.
                    if report.disposition == Disposition::Requeued
                        && !self.pause(&cancel_token).await
                    {
                        break;
                    }
                }
                Ok(None) => {
                    if !self.pause(&cancel_token).await {
                        break;
                    }
                }
                Err(err) => {
                    error!(message = "Error receiving message from queue", error = %err);
                    if !self.pause(&cancel_token).await {
                        break;
                    }
                }
            }
        }
        info!("Worker stopped.");
    }

    /// Returns false when cancelled while waiting.
    async fn pause(&self, cancel_token: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                false
            },
            _ = sleep(self.config.poll_interval) => true,
        }
    }

    /// Processes one delivery and acks or nacks it.
    #[instrument(
        name = "message",
        skip_all,
        fields(delivery_tag = delivery.tag, message_id = %delivery.message_id, redelivered = delivery.redelivered())
    )]
    pub async fn handle_delivery(&self, delivery: Delivery) -> MessageReport {
        let mut report = MessageReport::received();

        if let Some(max) = self.config.max_deliveries {
            if delivery.delivery_count > max {
                error!(
                    delivery_count = delivery.delivery_count,
                    max_deliveries = max,
                    "Discarding message after too many deliveries"
                );
                report.disposition = Disposition::Discarded;
                report.failure = Some(MessageFailure::TooManyDeliveries(delivery.delivery_count));
                self.settle(&delivery, &mut report).await;
                return report;
            }
        }

        let request = match ProcessingRequest::from_slice(&delivery.body) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Discarding malformed message");
                report.disposition = Disposition::Discarded;
                report.failure = Some(err.into());
                self.settle(&delivery, &mut report).await;
                return report;
            }
        };
        report.stage = Stage::Parsed;
        debug!(
            record_id = request.record_id,
            owner_id = request.owner_id,
            images = request.image_refs.len(),
            "Parsed processing request"
        );

        report.images = self.process_images(&request).await;
        report.stage = Stage::ImagesProcessed;

        let locators = report.locators();
        if locators.is_empty() {
            warn!(
                record_id = request.record_id,
                "No images were successfully processed"
            );
        }

        match self.update_catalog(&request, locators).await {
            Ok(()) => {
                report.stage = Stage::CatalogUpdated;
                report.disposition = Disposition::Acknowledged;
            }
            Err(err) => {
                warn!(record_id = request.record_id, error = %err, "Catalog update failed, requeueing");
                report.disposition = Disposition::Requeued;
                report.failure = Some(err.into());
            }
        }

        self.settle(&delivery, &mut report).await;
        report
    }

    /// Runs every image reference through the pipeline, keeping request order.
    pub async fn process_images(&self, request: &ProcessingRequest) -> Vec<ImageOutcome> {
        let concurrency = self.config.image_concurrency.max(1);
        let pending: Vec<_> = request
            .image_refs
            .iter()
            .map(|image_ref| self.process_image(request.record_id, image_ref).boxed())
            .collect();
        stream::iter(pending)
            .buffered(concurrency)
            .collect::<Vec<_>>()
            .await
    }

    #[instrument(skip(self))]
    async fn process_image(&self, record_id: i64, image_ref: &str) -> ImageOutcome {
        match self.store_image(record_id, image_ref).await {
            Ok(locator) => {
                info!(locator = %locator, "Stored processed image");
                ImageOutcome::Stored {
                    image_ref: image_ref.to_string(),
                    locator,
                }
            }
            Err(error) => {
                warn!(error = %error, "Skipping image");
                ImageOutcome::Failed {
                    image_ref: image_ref.to_string(),
                    error,
                }
            }
        }
    }

    async fn store_image(&self, record_id: i64, image_ref: &str) -> Result<String, ImageError> {
        let data = self.fetcher.fetch(image_ref).await?;
        let format = SourceFormat::from_reference(image_ref);
        let image = self.transcoder.transcode_async(data, format).await?;
        debug!(
            width = image.width,
            height = image.height,
            size = image.bytes.len(),
            "Transcoded image"
        );

        let key = object_key(record_id, image_ref, self.suffix.next());
        let content_type = image.mime();
        Ok(self.store.put_object(&key, image.bytes, content_type).await?)
    }

    /// Replaces the record's processed images with `locators`, bounded by
    /// the catalog timeout when one is configured.
    async fn update_catalog(
        &self,
        request: &ProcessingRequest,
        locators: Vec<String>,
    ) -> Result<(), RepositoryError> {
        let write = self.write_locators(request, locators);
        match self.config.catalog_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| RepositoryError::Timeout)?,
            None => write.await,
        }
    }

    /// Read-modify-write of the record. The write is conditional on the
    /// requesting owner.
    async fn write_locators(
        &self,
        request: &ProcessingRequest,
        locators: Vec<String>,
    ) -> Result<(), RepositoryError> {
        let mut record = self.catalog.get(request.record_id).await?;
        if record.owner_id != request.owner_id {
            warn!(
                record_id = record.id,
                record_owner = record.owner_id,
                request_owner = request.owner_id,
                "Processing request owner does not own the record"
            );
        }
        record.owner_id = request.owner_id;
        record.processed_images = locators;
        self.catalog.update(&record).await
    }

    async fn settle(&self, delivery: &Delivery, report: &mut MessageReport) {
        let result = match report.disposition {
            Disposition::Acknowledged => self.queue.ack(delivery).await,
            Disposition::Discarded => self.queue.nack(delivery, false).await,
            Disposition::Requeued => self.queue.nack(delivery, true).await,
        };
        match result {
            Ok(()) => {
                report.settled = true;
                if report.disposition == Disposition::Acknowledged {
                    report.stage = Stage::Acknowledged;
                }
                debug!(disposition = ?report.disposition, "Settled message");
            }
            Err(err) => {
                // Left unacknowledged; the queue redelivers it after recovery.
                error!(
                    message = "Failed to settle message",
                    disposition = ?report.disposition,
                    error = %err
                );
            }
        }
    }
}

/// Running worker loop.
pub struct WorkerHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Signals cancellation and waits for the loop to exit.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.cancel_token.cancel();
        self.join_handle.await
    }

    /// Waits for the loop to exit without cancelling it.
    pub async fn join(self) -> Result<(), JoinError> {
        self.join_handle.await
    }
}
