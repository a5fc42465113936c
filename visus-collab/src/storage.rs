//! Persistent annotation storage.
//!
//! The save/load contract the collaboration facade consumes:
//! [`AnnotationStore`] persists the full annotation set of an image and
//! hands it back on demand. Both operations are idempotent — resending
//! the same set on a retry is harmless, so at-least-once callers need
//! no dedup.
//!
//! Two implementations: [`MemoryStore`] for tests and embedding, and
//! [`RocksStore`], a RocksDB column family of LZ4-compressed bincode
//! blobs keyed by image id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use tokio::sync::RwLock;
use uuid::Uuid;

use visus_scene::Annotation;

/// Column family holding one blob per image.
const CF_ANNOTATIONS: &str = "annotations";

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    Database(String),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// Decompression failed
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// The persistence collaborator the facade saves to and loads from.
///
/// Loading an image that was never saved yields an empty set, not an
/// error — a fresh image simply has no annotations yet.
#[async_trait::async_trait]
pub trait AnnotationStore: Send + Sync {
    async fn save_annotations(
        &self,
        image_id: Uuid,
        annotations: &[Annotation],
    ) -> Result<(), StoreError>;

    async fn load_annotations(&self, image_id: Uuid) -> Result<Vec<Annotation>, StoreError>;
}

/// In-memory store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<Uuid, Vec<Annotation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl AnnotationStore for MemoryStore {
    async fn save_annotations(
        &self,
        image_id: Uuid,
        annotations: &[Annotation],
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .insert(image_id, annotations.to_vec());
        Ok(())
    }

    async fn load_annotations(&self, image_id: Uuid) -> Result<Vec<Annotation>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .get(&image_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// RocksDB store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub create_if_missing: bool,
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_if_missing: true,
        }
    }
}

/// Durable annotation store: one LZ4-compressed bincode blob per image.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);

        let cf = ColumnFamilyDescriptor::new(CF_ANNOTATIONS, Options::default());
        let db = DB::open_cf_descriptors(&opts, &config.path, vec![cf])?;
        Ok(Self { db })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_ANNOTATIONS)
            .ok_or_else(|| StoreError::Database("missing annotations column family".into()))
    }

    /// All image ids with a saved annotation set.
    pub fn list_images(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf()?;
        let mut images = Vec::new();
        for entry in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = entry?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                images.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(images)
    }
}

#[async_trait::async_trait]
impl AnnotationStore for RocksStore {
    async fn save_annotations(
        &self,
        image_id: Uuid,
        annotations: &[Annotation],
    ) -> Result<(), StoreError> {
        let encoded = bincode::serde::encode_to_vec(annotations, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        let cf = self.cf()?;
        self.db.put_cf(cf, image_id.as_bytes(), compressed)?;
        log::debug!(
            "persisted {} annotations for image {image_id} ({} bytes)",
            annotations.len(),
            encoded.len()
        );
        Ok(())
    }

    async fn load_annotations(&self, image_id: Uuid) -> Result<Vec<Annotation>, StoreError> {
        let cf = self.cf()?;
        let Some(compressed) = self.db.get_cf(cf, image_id.as_bytes())? else {
            return Ok(Vec::new());
        };
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (annotations, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visus_scene::{AnnotationShape, Point};

    fn sample(n: usize) -> Vec<Annotation> {
        (0..n)
            .map(|i| {
                Annotation::new(
                    Uuid::nil(),
                    Uuid::new_v4(),
                    i as u64,
                    AnnotationShape::Marker {
                        at: Point::new(i as f32, 2.0 * i as f32),
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let image = Uuid::new_v4();
        let annotations = sample(3);

        store.save_annotations(image, &annotations).await.unwrap();
        assert_eq!(store.load_annotations(image).await.unwrap(), annotations);
    }

    #[tokio::test]
    async fn test_memory_store_missing_image_is_empty() {
        let store = MemoryStore::new();
        assert!(store.load_annotations(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_resave_is_idempotent() {
        let store = MemoryStore::new();
        let image = Uuid::new_v4();
        let annotations = sample(2);

        store.save_annotations(image, &annotations).await.unwrap();
        store.save_annotations(image, &annotations).await.unwrap();
        assert_eq!(store.load_annotations(image).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rocks_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::at(dir.path())).unwrap();
        let image = Uuid::new_v4();
        let annotations = sample(5);

        store.save_annotations(image, &annotations).await.unwrap();
        assert_eq!(store.load_annotations(image).await.unwrap(), annotations);
    }

    #[tokio::test]
    async fn test_rocks_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let image = Uuid::new_v4();
        let annotations = sample(4);

        {
            let store = RocksStore::open(StoreConfig::at(dir.path())).unwrap();
            store.save_annotations(image, &annotations).await.unwrap();
        }

        let store = RocksStore::open(StoreConfig::at(dir.path())).unwrap();
        assert_eq!(store.load_annotations(image).await.unwrap(), annotations);
        assert_eq!(store.list_images().unwrap(), vec![image]);
    }

    #[tokio::test]
    async fn test_rocks_store_overwrite_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::at(dir.path())).unwrap();
        let image = Uuid::new_v4();

        store.save_annotations(image, &sample(5)).await.unwrap();
        store.save_annotations(image, &sample(1)).await.unwrap();
        assert_eq!(store.load_annotations(image).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rocks_store_missing_image_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::at(dir.path())).unwrap();
        assert!(store.load_annotations(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
