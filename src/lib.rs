use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod publisher;
pub mod queue;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod transcode;
pub mod worker;

pub use error::{
    ImageError, ParseError, PublishError, QueueError, RepositoryError, StorageError,
    TranscodeError,
};

/// Request to process the source images of one catalog record.
///
/// The wire shape is the JSON object `{product_id, user_id, image_urls}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    #[serde(rename = "product_id")]
    pub record_id: i64,
    #[serde(rename = "user_id")]
    pub owner_id: i64,
    #[serde(rename = "image_urls")]
    pub image_refs: Vec<String>,
}

impl ProcessingRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, ParseError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CatalogRecord {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub source_images: Vec<String>,
    /// Written only by the processing worker.
    pub processed_images: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogRecord {
    pub fn validate(&self) -> Result<(), RepositoryError> {
        validate_fields(self.owner_id, &self.name, self.price)
    }
}

/// Fields supplied by the catalog write path when a record is created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCatalogRecord {
    pub owner_id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub source_images: Vec<String>,
}

impl NewCatalogRecord {
    pub fn validate(&self) -> Result<(), RepositoryError> {
        validate_fields(self.owner_id, &self.name, self.price)
    }
}

fn validate_fields(owner_id: i64, name: &str, price: f64) -> Result<(), RepositoryError> {
    if owner_id <= 0 {
        return Err(RepositoryError::Invalid("invalid owner id".into()));
    }
    if name.is_empty() {
        return Err(RepositoryError::Invalid("product name is required".into()));
    }
    if price.is_nan() || price < 0.0 {
        return Err(RepositoryError::Invalid(
            "product price cannot be negative".into(),
        ));
    }
    Ok(())
}

/// Last non-empty path segment of an image reference, ignoring any query
/// string or fragment. Falls back to `"image"` when the reference has none.
pub(crate) fn file_name_of(reference: &str) -> String {
    let path = match url::Url::parse(reference) {
        Ok(url) => url.path().to_string(),
        Err(_) => reference
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("image")
        .to_string()
}

/// Lowercased extension of [`file_name_of`], including the leading dot.
pub(crate) fn extension_of(reference: &str) -> Option<String> {
    let name = file_name_of(reference);
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => Some(name[idx..].to_ascii_lowercase()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Processing,
}
