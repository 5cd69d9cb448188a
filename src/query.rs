use crate::chunk::{ceil_to, chunk_span, floor_to};
use crate::config::CoreConfig;
use crate::error::PulseError;
use crate::store::DocumentStore;
use crate::telemetry::{db_metrics, CoreEvent, CoreEventListener};
use crate::types::{Chunk, ChunkMetadata, Matrix, Timestamp, Value};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Points of one series read from one chunk.
struct SeriesSlice {
    group_code: String,
    path: String,
    points: Vec<(Timestamp, Value)>,
}

/// Fan-out / fan-in reader over the chunk collections.
#[derive(Debug)]
pub struct ChunkQueryEngine {
    store: Arc<dyn DocumentStore>,
    chunk_point_count: usize,
    batch_size: usize,
    threads: usize,
    events: Arc<dyn CoreEventListener>,
}

impl ChunkQueryEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CoreConfig) -> Result<Self, PulseError> {
        config.validate()?;
        Ok(ChunkQueryEngine {
            store,
            chunk_point_count: config.chunk_point_count,
            batch_size: config.query_batch_size,
            threads: config.query_threads,
            events: Arc::clone(&config.event_listener),
        })
    }

    /// Reads every point of `paths` in `[range_start, range_end)`.
    ///
    /// Paths are resolved to their series and grouped by owning group; each group is split
    /// into batches of at most `query_batch_size` series and every batch issues one range
    /// query per backing collection. The range is widened to whole chunks for the store
    /// query and trimmed back afterwards. All sub-queries run on a pool that lives for
    /// this call only; the first failing sub-query fails the extraction.
    ///
    /// # Errors
    /// * `InvalidArgument` if `range_start >= range_end`.
    /// * `ConsistencyViolation` if a returned chunk is empty, misaligned or holds points
    ///   outside the queried window.
    pub fn extract(
        &self,
        paths: &[String],
        range_start: Timestamp,
        range_end: Timestamp,
    ) -> Result<Matrix, PulseError> {
        if range_start >= range_end {
            return Err(PulseError::InvalidArgument(format!(
                "invalid time range: start={}, end={}",
                range_start, range_end
            )));
        }

        let started = Instant::now();
        let by_group = self.resolve(paths)?;
        if by_group.is_empty() {
            return Ok(Matrix::new());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("pulse-read-{}", i))
            .build()
            .map_err(|e| PulseError::BackgroundTaskError(format!("read pool: {}", e)))?;

        let store = self.store.as_ref();
        let batch_size = self.batch_size;
        let chunk_point_count = self.chunk_point_count;

        let slices: Vec<Vec<SeriesSlice>> = pool.install(|| {
            by_group
                .par_iter()
                .flat_map(|(_, series)| series.par_chunks(batch_size))
                .map(|batch| {
                    group_by_collection(batch)
                        .into_par_iter()
                        .map(|(collection, metas)| {
                            read_collection(
                                store,
                                collection,
                                &metas,
                                chunk_point_count,
                                range_start,
                                range_end,
                            )
                        })
                        .collect::<Result<Vec<_>, PulseError>>()
                })
                .collect::<Result<Vec<_>, PulseError>>()
                .map(|nested| nested.into_iter().flatten().collect())
        })?;

        let mut matrix = Matrix::new();
        let mut chunk_count = 0;
        for slice in slices.into_iter().flatten() {
            chunk_count += 1;
            let series = matrix
                .entry(slice.group_code)
                .or_default()
                .entry(slice.path)
                .or_default();
            series.extend(slice.points);
        }
        db_metrics::record_extraction(started.elapsed(), chunk_count as u64);
        self.events.on_event(CoreEvent::ExtractionCompleted {
            paths: paths.len(),
            chunks: chunk_count,
        });
        Ok(matrix)
    }

    /// Maps requested paths onto registered series, grouped by group code.
    fn resolve(&self, paths: &[String]) -> Result<BTreeMap<String, Vec<ChunkMetadata>>, PulseError> {
        let mut by_path: HashMap<&str, Vec<ChunkMetadata>> = HashMap::new();
        let all = self.store.find_all_metadata()?;
        for meta in &all {
            by_path.entry(meta.path.as_str()).or_default().push(meta.clone());
        }

        let mut by_group: BTreeMap<String, Vec<ChunkMetadata>> = BTreeMap::new();
        for path in paths {
            match by_path.remove(path.as_str()) {
                Some(series) => {
                    for meta in series {
                        by_group.entry(meta.group_code.clone()).or_default().push(meta);
                    }
                }
                None => tracing::debug!(path = %path, "no series registered for path"),
            }
        }
        Ok(by_group)
    }
}

fn group_by_collection(batch: &[ChunkMetadata]) -> Vec<(&str, Vec<&ChunkMetadata>)> {
    let mut grouped: BTreeMap<&str, Vec<&ChunkMetadata>> = BTreeMap::new();
    for meta in batch {
        grouped.entry(meta.collection.as_str()).or_default().push(meta);
    }
    grouped.into_iter().collect()
}

/// One range query against one collection, verified and trimmed.
fn read_collection(
    store: &dyn DocumentStore,
    collection: &str,
    metas: &[&ChunkMetadata],
    chunk_point_count: usize,
    range_start: Timestamp,
    range_end: Timestamp,
) -> Result<Vec<SeriesSlice>, PulseError> {
    // A collection is keyed by sampling rate, so every series in it shares the span.
    let Some(first) = metas.first() else {
        return Ok(Vec::new());
    };
    let span = chunk_span(chunk_point_count, first.sampling_rate).ok_or_else(|| {
        PulseError::InvalidArgument(format!("chunk span of {} overflows", collection))
    })?;
    // Both edges saturate, so open-ended reads up to i64::MAX stay valid.
    let lower = floor_to(range_start, span);
    let upper = ceil_to(range_end, span);

    let by_safe_path: HashMap<&str, &ChunkMetadata> =
        metas.iter().map(|m| (m.safe_path.as_str(), *m)).collect();
    let safe_paths: Vec<String> = by_safe_path.keys().map(|p| p.to_string()).collect();

    let chunks = store.range_query(collection, &safe_paths, lower, upper)?;
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        verify_chunk(&chunk, lower, upper)?;
        let Some(meta) = by_safe_path.get(chunk.safe_path.as_str()) else {
            continue;
        };
        let points = chunk
            .timestamps
            .into_iter()
            .zip(chunk.values)
            .filter(|(ts, _)| *ts >= range_start && *ts < range_end)
            .collect();
        out.push(SeriesSlice {
            group_code: meta.group_code.clone(),
            path: meta.path.clone(),
            points,
        });
    }
    Ok(out)
}

/// Rejects chunks that cannot have been produced by the bucketing writer.
pub fn verify_chunk(chunk: &Chunk, lower: Timestamp, upper: Timestamp) -> Result<(), PulseError> {
    let violation = |details: String| -> Result<(), PulseError> {
        tracing::error!(chunk = %chunk.id, details = %details, "corrupt chunk");
        Err(PulseError::ConsistencyViolation {
            chunk_id: chunk.id.clone(),
            details,
        })
    };

    let (Some(&first), Some(&last)) = (chunk.timestamps.first(), chunk.timestamps.last()) else {
        return violation("chunk has no timestamps".to_string());
    };
    if chunk.values.len() != chunk.timestamps.len() {
        return violation(format!(
            "{} timestamps but {} values",
            chunk.timestamps.len(),
            chunk.values.len()
        ));
    }
    if first < lower {
        return violation(format!("first timestamp {} below lower bound {}", first, lower));
    }
    if last >= upper {
        return violation(format!("last timestamp {} not below upper bound {}", last, upper));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SeriesKey;
    use crate::store::{ChunkAppend, MemoryDocumentStore};
    use crate::types::DataType;

    fn chunk(timestamps: Vec<Timestamp>) -> Chunk {
        Chunk {
            id: "c".to_string(),
            safe_path: "p".to_string(),
            data_type: DataType::Double,
            sampling_rate: 1000,
            ts_start: 1_024_000,
            ts_end: 2_048_000,
            values: timestamps.iter().map(|_| Value::Double(0.0)).collect(),
            batch_ids: vec![None; timestamps.len()],
            timestamps,
        }
    }

    #[test]
    fn test_verify_chunk_bounds() {
        assert!(verify_chunk(&chunk(vec![1_024_000, 2_047_000]), 1_024_000, 2_048_000).is_ok());

        assert!(matches!(
            verify_chunk(&chunk(vec![]), 1_024_000, 2_048_000),
            Err(PulseError::ConsistencyViolation { .. })
        ));
        assert!(matches!(
            verify_chunk(&chunk(vec![1_000, 1_500_000]), 1_024_000, 2_048_000),
            Err(PulseError::ConsistencyViolation { .. })
        ));
        assert!(matches!(
            verify_chunk(&chunk(vec![1_500_000, 2_048_000]), 1_024_000, 2_048_000),
            Err(PulseError::ConsistencyViolation { .. })
        ));

        let mut misaligned = chunk(vec![1_500_000]);
        misaligned.values.clear();
        assert!(verify_chunk(&misaligned, 1_024_000, 2_048_000).is_err());
    }

    #[test]
    fn test_extract_rejects_empty_range() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = ChunkQueryEngine::new(store, &CoreConfig::default()).unwrap();
        assert!(matches!(
            engine.extract(&["a".to_string()], 10, 10),
            Err(PulseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_extract_fails_whole_read_on_corrupt_chunk() {
        let store = Arc::new(MemoryDocumentStore::new());
        let key = SeriesKey::new("temp", DataType::Double, 1000);
        store
            .upsert_metadata_if_absent(
                &key,
                ChunkMetadata {
                    id: key.id(),
                    group_code: "g".to_string(),
                    path: "temp".to_string(),
                    safe_path: "temp".to_string(),
                    data_type: DataType::Double,
                    sampling_rate: 1000,
                    collection: "PulseChunks_g_DOUBLE_1000".to_string(),
                },
            )
            .unwrap();
        // Chunk claims [1_024_000, 2_048_000) but holds a point from the chunk before it.
        store
            .append_chunk(ChunkAppend {
                collection: "PulseChunks_g_DOUBLE_1000".to_string(),
                key: key.chunk(1_024_000),
                ts_end: 2_048_000,
                timestamps: vec![1_000, 1_500_000],
                values: vec![Value::Double(1.0), Value::Double(2.0)],
                batch_ids: vec![None, None],
            })
            .unwrap();

        let engine = ChunkQueryEngine::new(store, &CoreConfig::default()).unwrap();
        let result = engine.extract(&["temp".to_string()], 1_500_000, 1_600_000);
        assert!(matches!(result, Err(PulseError::ConsistencyViolation { .. })));
    }
}
