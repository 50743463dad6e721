#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use image_relay::catalog::CatalogRepository;
use image_relay::fetch::ImageFetcher;
use image_relay::queue::MemoryQueue;
use image_relay::storage::ObjectStore;
use image_relay::transcode::Transcoder;
use image_relay::worker::{Worker, WorkerConfig};
use image_relay::{CatalogRecord, ImageError, NewCatalogRecord, RepositoryError, StorageError};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BUCKET_URL: &str = "https://test-bucket.s3.amazonaws.com";

pub fn encode(width: u32, height: u32, format: ImageFormat) -> Bytes {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 120, 200])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    Bytes::from(buf)
}

/// Serves registered bytes; any other URL fails to download.
#[derive(Default)]
pub struct StubFetcher {
    images: Mutex<HashMap<String, Bytes>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn with(self, url: &str, data: Bytes) -> Self {
        self.images.lock().unwrap().insert(url.to_string(), data);
        self
    }

    pub fn delayed(self, url: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, ImageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.images
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ImageError::Download {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    pub body: Bytes,
}

/// Records every put; keys containing a registered fragment fail.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<Vec<StoredObject>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn failing_on(self, fragment: &str) -> Self {
        self.failing.lock().unwrap().push(fragment.to_string());
        self
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        if self.failing.lock().unwrap().iter().any(|f| key.contains(f)) {
            return Err(StorageError {
                key: key.to_string(),
                reason: "quota exceeded".to_string(),
            });
        }
        self.objects.lock().unwrap().push(StoredObject {
            key: key.to_string(),
            content_type: content_type.to_string(),
            body,
        });
        Ok(format!("{BUCKET_URL}/{key}"))
    }
}

/// Catalog keyed by record id, with the same owner check as the SQL update.
#[derive(Default)]
pub struct MemoryCatalog {
    records: Mutex<HashMap<i64, CatalogRecord>>,
    next_id: AtomicUsize,
    reject_updates: AtomicBool,
    get_delay: Mutex<Option<Duration>>,
}

impl MemoryCatalog {
    pub fn seed(&self, owner_id: i64, source_images: &[&str]) -> CatalogRecord {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let now = Utc::now();
        let record = CatalogRecord {
            id,
            owner_id,
            name: format!("product {id}"),
            description: String::new(),
            price: 10.0,
            source_images: source_images.iter().map(|s| s.to_string()).collect(),
            processed_images: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.records.lock().unwrap().insert(id, record.clone());
        record
    }

    pub fn record(&self, id: i64) -> CatalogRecord {
        self.records.lock().unwrap()[&id].clone()
    }

    pub fn set_processed(&self, id: i64, processed: Vec<String>) {
        self.records
            .lock()
            .unwrap()
            .get_mut(&id)
            .unwrap()
            .processed_images = processed;
    }

    pub fn reject_updates(&self, reject: bool) {
        self.reject_updates.store(reject, Ordering::SeqCst);
    }

    pub fn delay_reads(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl CatalogRepository for MemoryCatalog {
    async fn get(&self, id: i64) -> Result<CatalogRecord, RepositoryError> {
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.records
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::NotFound { id, owner_id: None })
    }

    async fn update(&self, record: &CatalogRecord) -> Result<(), RepositoryError> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(RepositoryError::Conflict("serialization failure".into()));
        }
        record.validate()?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&record.id) {
            Some(stored) if stored.owner_id == record.owner_id => {
                let mut updated = record.clone();
                updated.updated_at = Utc::now();
                *stored = updated;
                Ok(())
            }
            _ => Err(RepositoryError::NotFound {
                id: record.id,
                owner_id: Some(record.owner_id),
            }),
        }
    }

    async fn insert(&self, record: &NewCatalogRecord) -> Result<i64, RepositoryError> {
        record.validate()?;
        let refs: Vec<&str> = record.source_images.iter().map(String::as_str).collect();
        Ok(self.seed(record.owner_id, &refs).id)
    }
}

pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub fetcher: Arc<StubFetcher>,
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<MemoryCatalog>,
}

impl Harness {
    pub fn new(fetcher: StubFetcher) -> Self {
        Self::with_store(fetcher, MemoryStore::default())
    }

    pub fn with_store(fetcher: StubFetcher, store: MemoryStore) -> Self {
        Self {
            queue: Arc::new(MemoryQueue::new()),
            fetcher: Arc::new(fetcher),
            store: Arc::new(store),
            catalog: Arc::new(MemoryCatalog::default()),
        }
    }

    pub fn worker(&self, config: WorkerConfig) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.fetcher.clone(),
            self.store.clone(),
            self.catalog.clone(),
            Transcoder::default(),
            config,
        )
    }
}
