//! Catalog record access.
//!
//! The repository never merges partial updates: callers read the full record,
//! modify it and write it back. Concurrent writers race and the last
//! `update` wins.

use crate::db::DbHandle;
use crate::error::RepositoryError;
use crate::{CatalogRecord, NewCatalogRecord};
use async_trait::async_trait;

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get(&self, id: i64) -> Result<CatalogRecord, RepositoryError>;

    /// Writes the full record. Fails with [`RepositoryError::NotFound`] when no
    /// row matches `(id, owner_id)`.
    async fn update(&self, record: &CatalogRecord) -> Result<(), RepositoryError>;

    async fn insert(&self, record: &NewCatalogRecord) -> Result<i64, RepositoryError>;
}

#[async_trait]
impl CatalogRepository for DbHandle {
    async fn get(&self, id: i64) -> Result<CatalogRecord, RepositoryError> {
        self.get_product(id)
            .await?
            .ok_or(RepositoryError::NotFound { id, owner_id: None })
    }

    async fn update(&self, record: &CatalogRecord) -> Result<(), RepositoryError> {
        record.validate()?;
        match self.update_product(record).await? {
            0 => Err(RepositoryError::NotFound {
                id: record.id,
                owner_id: Some(record.owner_id),
            }),
            _ => Ok(()),
        }
    }

    async fn insert(&self, record: &NewCatalogRecord) -> Result<i64, RepositoryError> {
        record.validate()?;
        Ok(self.insert_product(record).await?)
    }
}
