use crate::{CatalogRecord, NewCatalogRecord, Status};
use anyhow::Error;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

const PRODUCT_COLUMNS: &str = "id, \
    user_id AS owner_id, \
    product_name AS name, \
    COALESCE(product_description, '') AS description, \
    product_price::float8 AS price, \
    COALESCE(product_images, '{}') AS source_images, \
    COALESCE(compressed_product_images, '{}') AS processed_images, \
    COALESCE(created_at, now()) AS created_at, \
    COALESCE(updated_at, created_at, now()) AS updated_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct QueuedMessage {
    pub id: i64,
    pub message_id: Uuid,
    pub body: Vec<u8>,
    pub delivery_count: i32,
}

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }

    #[instrument(name = "db.get_product", skip(self))]
    pub(crate) async fn get_product(&self, id: i64) -> Result<Option<CatalogRecord>, sqlx::Error> {
        let query = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
        sqlx::query_as::<_, CatalogRecord>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
    }

    /// Returns the number of rows matched by `(id, user_id)`.
    #[instrument(name = "db.update_product", skip_all, fields(record_id = record.id))]
    pub(crate) async fn update_product(&self, record: &CatalogRecord) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE products \
                SET product_name = $2, \
                product_description = $3, \
                product_price = $4, \
                product_images = $5, \
                compressed_product_images = $6, \
                updated_at = now() \
            WHERE id = $1 AND user_id = $7",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.price)
        .bind(&record.source_images)
        .bind(&record.processed_images)
        .bind(record.owner_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(name = "db.insert_product", skip_all, fields(owner_id = record.owner_id))]
    pub(crate) async fn insert_product(&self, record: &NewCatalogRecord) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO products \
            (user_id, product_name, product_description, product_price, product_images, created_at, updated_at) \
            VALUES ($1, $2, $3, $4, $5, now(), now()) \
            RETURNING id",
        )
        .bind(record.owner_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.price)
        .bind(&record.source_images)
        .fetch_one(&*self.pool)
        .await
    }

    pub(crate) async fn enqueue_message(
        &self,
        queue: &str,
        message_id: Uuid,
        body: &[u8],
    ) -> Result<i64, sqlx::Error> {
        debug!(queue = %queue, message_id = %message_id, "Enqueueing message");
        sqlx::query_scalar(
            "INSERT INTO image_queue (queue, message_id, body, status) \
            VALUES ($1, $2, $3, $4) \
            RETURNING id",
        )
        .bind(queue)
        .bind(message_id)
        .bind(body)
        .bind(Status::Queued)
        .fetch_one(&*self.pool)
        .await
    }

    /// Claims the oldest ready message under a fresh `lease`, skipping rows
    /// locked by other consumers. A message whose lease is older than
    /// `lease_secs` counts as ready again.
    pub(crate) async fn claim_message(
        &self,
        queue: &str,
        lease: Uuid,
        lease_secs: f64,
    ) -> Result<Option<QueuedMessage>, sqlx::Error> {
        sqlx::query_as::<_, QueuedMessage>(
            "UPDATE image_queue \
                SET status = $2, \
                lease_id = $3, \
                delivery_count = delivery_count + 1, \
                started_at = now() \
            WHERE id = ( \
                SELECT id FROM image_queue \
                WHERE queue = $1 \
                AND (status = $4 \
                    OR (status = $2 AND started_at < now() - $5 * interval '1 second')) \
                ORDER BY enqueued_at, id \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING id, message_id, body, delivery_count",
        )
        .bind(queue)
        .bind(Status::Processing)
        .bind(lease)
        .bind(Status::Queued)
        .bind(lease_secs)
        .fetch_optional(&*self.pool)
        .await
    }

    /// Deletes a message, provided `lease` still holds it.
    pub(crate) async fn delete_message(&self, id: i64, lease: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM image_queue WHERE id = $1 AND lease_id = $2")
            .bind(id)
            .bind(lease)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Moves a leased message to the back of the queue.
    pub(crate) async fn requeue_message(&self, id: i64, lease: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE image_queue \
                SET status = $3, \
                lease_id = NULL, \
                started_at = NULL, \
                enqueued_at = clock_timestamp() \
            WHERE id = $1 AND lease_id = $2",
        )
        .bind(id)
        .bind(lease)
        .bind(Status::Queued)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Releases messages whose lease is older than `lease_secs`.
    pub(crate) async fn release_expired_messages(
        &self,
        queue: &str,
        lease_secs: f64,
    ) -> Result<u64, sqlx::Error> {
        debug!(queue = %queue, lease_secs, "Releasing expired leases");
        let result = sqlx::query(
            "UPDATE image_queue \
                SET status = $2, \
                lease_id = NULL, \
                started_at = NULL \
            WHERE queue = $1 AND status = $3 \
            AND started_at < now() - $4 * interval '1 second'",
        )
        .bind(queue)
        .bind(Status::Queued)
        .bind(Status::Processing)
        .bind(lease_secs)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
