use crate::chunk::{ChunkKey, SeriesKey};
use crate::error::PulseError;
use crate::types::{Chunk, ChunkMetadata, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

/// One append-or-create operation against a single chunk document.
///
/// Header fields (`collection`, `key`, `ts_end`) are only used when the chunk does not
/// exist yet; the three arrays are appended in either case.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAppend {
    pub collection: String,
    pub key: ChunkKey,
    pub ts_end: Timestamp,
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<Value>,
    pub batch_ids: Vec<Option<String>>,
}

impl ChunkAppend {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Abstract document store the core persists through.
///
/// Every operation must be atomic at the single-document level; the core never needs
/// multi-document transactions.
pub trait DocumentStore: std::fmt::Debug + Send + Sync + 'static {
    /// Inserts `on_insert` unless a record with `key` exists. Returns the stored record.
    fn upsert_metadata_if_absent(
        &self,
        key: &SeriesKey,
        on_insert: ChunkMetadata,
    ) -> Result<ChunkMetadata, PulseError>;

    /// Appends the arrays of `append` to its chunk, creating the chunk first if needed.
    fn append_chunk(&self, append: ChunkAppend) -> Result<(), PulseError>;

    /// Chunks of `collection` whose safe path is in `safe_paths` and whose window lies
    /// within `[ts_start, ts_end]` (`chunk.ts_start >= ts_start && chunk.ts_end <= ts_end`).
    fn range_query(
        &self,
        collection: &str,
        safe_paths: &[String],
        ts_start: Timestamp,
        ts_end: Timestamp,
    ) -> Result<Vec<Chunk>, PulseError>;

    fn find_all_metadata(&self) -> Result<Vec<ChunkMetadata>, PulseError>;

    fn find_metadata_by_key(&self, key: &SeriesKey) -> Result<Option<ChunkMetadata>, PulseError>;
}

type Collection = Arc<Mutex<BTreeMap<ChunkKey, Chunk>>>;

/// Serializable image of a [`MemoryDocumentStore`], used by snapshots.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreImage {
    pub metadata: Vec<ChunkMetadata>,
    pub collections: Vec<(String, Vec<Chunk>)>,
}

/// In-memory document store.
///
/// Each collection sits behind its own mutex, so appends to different collections do not
/// contend and every single-chunk append is atomic.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    metadata: RwLock<BTreeMap<SeriesKey, ChunkMetadata>>,
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, name: &str) -> Result<Collection, PulseError> {
        if let Some(c) = self.collections.read()?.get(name) {
            return Ok(Arc::clone(c));
        }
        let mut guard = self.collections.write()?;
        Ok(Arc::clone(guard.entry(name.to_string()).or_default()))
    }

    /// Number of metadata records.
    pub fn metadata_count(&self) -> Result<usize, PulseError> {
        Ok(self.metadata.read()?.len())
    }

    /// Number of chunks in `collection` (0 when the collection does not exist).
    pub fn chunk_count(&self, collection: &str) -> Result<usize, PulseError> {
        match self.collections.read()?.get(collection) {
            Some(c) => Ok(c.lock()?.len()),
            None => Ok(0),
        }
    }

    /// Copies the full store contents into a serializable image.
    pub fn image(&self) -> Result<StoreImage, PulseError> {
        let metadata = self.metadata.read()?.values().cloned().collect();
        let mut names: Vec<(String, Collection)> = self
            .collections
            .read()?
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let mut collections = Vec::with_capacity(names.len());
        for (name, coll) in names {
            let chunks = coll.lock()?.values().cloned().collect();
            collections.push((name, chunks));
        }
        Ok(StoreImage {
            metadata,
            collections,
        })
    }

    /// Rebuilds a store from an image.
    pub fn from_image(image: StoreImage) -> Self {
        let metadata = image
            .metadata
            .into_iter()
            .map(|m| {
                let key = SeriesKey {
                    safe_path: m.safe_path.clone(),
                    data_type: m.data_type,
                    sampling_rate: m.sampling_rate,
                };
                (key, m)
            })
            .collect();
        let collections = image
            .collections
            .into_iter()
            .map(|(name, chunks)| {
                let map = chunks
                    .into_iter()
                    .map(|c| {
                        let key = SeriesKey {
                            safe_path: c.safe_path.clone(),
                            data_type: c.data_type,
                            sampling_rate: c.sampling_rate,
                        }
                        .chunk(c.ts_start);
                        (key, c)
                    })
                    .collect();
                (name, Arc::new(Mutex::new(map)))
            })
            .collect();
        MemoryDocumentStore {
            metadata: RwLock::new(metadata),
            collections: RwLock::new(collections),
        }
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn upsert_metadata_if_absent(
        &self,
        key: &SeriesKey,
        on_insert: ChunkMetadata,
    ) -> Result<ChunkMetadata, PulseError> {
        let mut guard = self.metadata.write()?;
        Ok(guard.entry(key.clone()).or_insert(on_insert).clone())
    }

    fn append_chunk(&self, append: ChunkAppend) -> Result<(), PulseError> {
        let coll = self.collection(&append.collection)?;
        let mut guard = coll.lock()?;
        let key = append.key;
        let chunk = guard.entry(key.clone()).or_insert_with(|| Chunk {
            id: key.id(),
            safe_path: key.series.safe_path.clone(),
            data_type: key.series.data_type,
            sampling_rate: key.series.sampling_rate,
            ts_start: key.ts_start,
            ts_end: append.ts_end,
            timestamps: Vec::new(),
            values: Vec::new(),
            batch_ids: Vec::new(),
        });
        chunk.timestamps.extend(append.timestamps);
        chunk.values.extend(append.values);
        chunk.batch_ids.extend(append.batch_ids);
        Ok(())
    }

    fn range_query(
        &self,
        collection: &str,
        safe_paths: &[String],
        ts_start: Timestamp,
        ts_end: Timestamp,
    ) -> Result<Vec<Chunk>, PulseError> {
        let Some(coll) = self.collections.read()?.get(collection).cloned() else {
            return Ok(Vec::new());
        };
        let guard = coll.lock()?;
        Ok(guard
            .values()
            .filter(|c| safe_paths.iter().any(|p| p == &c.safe_path))
            .filter(|c| c.ts_start >= ts_start && c.ts_end <= ts_end)
            .cloned()
            .collect())
    }

    fn find_all_metadata(&self) -> Result<Vec<ChunkMetadata>, PulseError> {
        Ok(self.metadata.read()?.values().cloned().collect())
    }

    fn find_metadata_by_key(&self, key: &SeriesKey) -> Result<Option<ChunkMetadata>, PulseError> {
        Ok(self.metadata.read()?.get(key).cloned())
    }
}
