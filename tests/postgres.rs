//! Queue and catalog behaviour against a live PostgreSQL.
//!
//! Run with `DATABASE_URL` set and `cargo test -- --ignored`.

use image_relay::catalog::CatalogRepository;
use image_relay::db::DbHandle;
use image_relay::queue::{MessageQueue, PgQueue};
use image_relay::{NewCatalogRecord, QueueError, RepositoryError};
use std::time::Duration;
use uuid::Uuid;

async fn connect() -> DbHandle {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    DbHandle::new(&url, 2).await.unwrap()
}

fn queue_name() -> String {
    format!("test_{}", Uuid::new_v4().simple())
}

async fn any_user_id() -> i64 {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    sqlx::query_scalar("SELECT user_id FROM users ORDER BY user_id LIMIT 1")
        .fetch_one(&pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn requeued_message_goes_behind_waiting_ones() {
    let queue = PgQueue::new(connect().await, queue_name());
    queue.publish(b"one".to_vec()).await.unwrap();
    queue.publish(b"two".to_vec()).await.unwrap();

    let one = queue.receive().await.unwrap().unwrap();
    assert_eq!(one.body, b"one");
    queue.nack(&one, true).await.unwrap();

    let two = queue.receive().await.unwrap().unwrap();
    assert_eq!(two.body, b"two");
    queue.ack(&two).await.unwrap();

    let again = queue.receive().await.unwrap().unwrap();
    assert_eq!(again.body, b"one");
    assert_eq!(again.delivery_count, 2);
    queue.ack(&again).await.unwrap();

    assert!(queue.receive().await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn held_message_is_not_delivered_twice() {
    let db = connect().await;
    let name = queue_name();
    let first = PgQueue::new(db.clone(), name.clone());
    let second = PgQueue::new(db, name);

    first.publish(b"one".to_vec()).await.unwrap();
    let delivery = first.receive().await.unwrap().unwrap();

    // A second consumer starting up leaves live leases alone.
    assert_eq!(second.recover().await.unwrap(), 0);
    assert!(second.receive().await.unwrap().is_none());

    first.ack(&delivery).await.unwrap();
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn lapsed_lease_is_redelivered_and_old_holder_cannot_settle() {
    let queue =
        PgQueue::new(connect().await, queue_name()).with_visibility_timeout(Duration::ZERO);
    queue.publish(b"one".to_vec()).await.unwrap();

    let stale = queue.receive().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let current = queue.receive().await.unwrap().unwrap();
    assert_eq!(current.tag, stale.tag);
    assert!(current.redelivered());

    assert!(matches!(
        queue.ack(&stale).await,
        Err(QueueError::UnknownDelivery(_))
    ));
    queue.ack(&current).await.unwrap();
    assert!(queue.receive().await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn catalog_update_checks_owner() {
    let db = connect().await;
    let owner_id = any_user_id().await;
    let id = db
        .insert(&NewCatalogRecord {
            owner_id,
            name: "lamp".into(),
            description: String::new(),
            price: 12.5,
            source_images: vec!["https://cdn.example.com/lamp.jpg".into()],
        })
        .await
        .unwrap();

    let mut record = db.get(id).await.unwrap();
    assert_eq!(record.price, 12.5);
    assert!(record.processed_images.is_empty());

    record.processed_images = vec!["https://b.s3.amazonaws.com/products/x.jpg".into()];
    db.update(&record).await.unwrap();
    assert_eq!(db.get(id).await.unwrap().processed_images.len(), 1);

    let mut foreign = record.clone();
    foreign.owner_id = owner_id + 1_000_000;
    assert!(matches!(
        db.update(&foreign).await,
        Err(RepositoryError::NotFound { .. })
    ));
    assert!(matches!(
        db.get(i64::MAX).await,
        Err(RepositoryError::NotFound { owner_id: None, .. })
    ));
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn unknown_owner_is_a_conflict() {
    let db = connect().await;
    let result = db
        .insert(&NewCatalogRecord {
            owner_id: i64::MAX,
            name: "ghost".into(),
            description: String::new(),
            price: 1.0,
            source_images: vec![],
        })
        .await;
    // foreign_key_violation (23503)
    assert!(matches!(result, Err(RepositoryError::Conflict(_))));
}
