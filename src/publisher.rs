use crate::error::PublishError;
use crate::queue::MessageQueue;
use crate::ProcessingRequest;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Hands processing requests from the catalog write path to the queue.
#[derive(Clone)]
pub struct Publisher {
    queue: Arc<dyn MessageQueue>,
}

impl Publisher {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    pub async fn publish(&self, request: &ProcessingRequest) -> Result<Uuid, PublishError> {
        let body = request.to_vec()?;
        Ok(self.queue.publish(body).await?)
    }

    /// Publishes without surfacing failure.
    ///
    /// The catalog write has already committed by the time this is called; a
    /// lost notification only leaves the record's images unprocessed.
    pub async fn publish_processing_request(
        &self,
        record_id: i64,
        owner_id: i64,
        image_refs: Vec<String>,
    ) {
        let request = ProcessingRequest {
            record_id,
            owner_id,
            image_refs,
        };
        match self.publish(&request).await {
            Ok(message_id) => info!(
                record_id,
                owner_id,
                images = request.image_refs.len(),
                message_id = %message_id,
                "Published image processing request"
            ),
            Err(err) => error!(
                record_id,
                owner_id,
                error = %err,
                "Failed to publish image processing request"
            ),
        }
    }
}
