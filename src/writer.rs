use crate::chunk::{chunk_bounds, chunk_span, collection_name, normalize, safe_path, SeriesKey};
use crate::config::CoreConfig;
use crate::error::PulseError;
use crate::pool::WritePool;
use crate::store::{ChunkAppend, DocumentStore};
use crate::telemetry::{db_metrics, CoreEvent, CoreEventListener};
use crate::types::{ChunkMetadata, DataType, Timestamp, Value};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one `write_async` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteResult {
    /// Chunks touched by the write.
    pub chunks: usize,
    /// Points appended.
    pub points: usize,
    /// Points dropped (non-positive timestamp or mistyped value).
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Registers series and appends points into time-bucketed chunks.
#[derive(Debug)]
pub struct ChunkWriter {
    store: Arc<dyn DocumentStore>,
    pool: WritePool,
    series_cache: DashMap<SeriesKey, Arc<ChunkMetadata>>,
    chunk_point_count: usize,
    events: Arc<dyn CoreEventListener>,
}

impl ChunkWriter {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CoreConfig) -> Result<Self, PulseError> {
        config.validate()?;
        let pool = WritePool::new(
            config.write_workers,
            config.write_queue_capacity,
            config.queue_warn_interval,
            Arc::clone(&config.event_listener),
        )?;
        Ok(ChunkWriter {
            store,
            pool,
            series_cache: DashMap::new(),
            chunk_point_count: config.chunk_point_count,
            events: Arc::clone(&config.event_listener),
        })
    }

    /// Returns the metadata of a series, creating it on first use.
    ///
    /// Safe under concurrent calls: the store's insert-if-absent decides the winner and
    /// every caller gets that record back.
    ///
    /// # Errors
    /// `InvalidArgument` when `path` is empty, `sampling_rate <= 1`, or one chunk of the
    /// series would span more than `i64::MAX` milliseconds.
    pub fn register_series(
        &self,
        group_code: &str,
        path: &str,
        data_type: DataType,
        sampling_rate: i64,
    ) -> Result<Arc<ChunkMetadata>, PulseError> {
        if path.is_empty() {
            return Err(PulseError::InvalidArgument("series path is empty".to_string()));
        }
        if sampling_rate <= 1 {
            return Err(PulseError::InvalidArgument(format!(
                "sampling rate of {} must be greater than 1, got {}",
                path, sampling_rate
            )));
        }
        if chunk_span(self.chunk_point_count, sampling_rate).is_none() {
            return Err(PulseError::InvalidArgument(format!(
                "sampling rate {} of {} overflows a {}-point chunk",
                sampling_rate, path, self.chunk_point_count
            )));
        }

        let key = SeriesKey::new(path, data_type, sampling_rate);
        if let Some(cached) = self.series_cache.get(&key) {
            return Ok(Arc::clone(cached.value()));
        }

        let candidate = ChunkMetadata {
            id: key.id(),
            group_code: group_code.to_string(),
            path: path.to_string(),
            safe_path: safe_path(path),
            data_type,
            sampling_rate,
            collection: collection_name(group_code, data_type, sampling_rate),
        };
        let stored = self.store.upsert_metadata_if_absent(&key, candidate)?;
        let entry = self
            .series_cache
            .entry(key)
            .or_insert_with(|| Arc::new(stored));
        Ok(Arc::clone(entry.value()))
    }

    /// Buckets `points` into chunks and appends them on the write pool.
    ///
    /// Points with a non-positive timestamp or a value that does not match the series
    /// type are skipped with a warning; the rest of the batch is still written. When the
    /// write queue is full the returned future fails with `Backpressure`.
    pub fn write_async(
        &self,
        metadata: Arc<ChunkMetadata>,
        points: BTreeMap<Timestamp, Value>,
        batch_ids: Option<BTreeMap<Timestamp, String>>,
    ) -> BoxFuture<'static, Result<WriteResult, PulseError>> {
        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        let chunk_point_count = self.chunk_point_count;
        self.pool.submit(move || {
            flush_points(
                store.as_ref(),
                events.as_ref(),
                &metadata,
                chunk_point_count,
                points,
                batch_ids.as_ref(),
            )
        })
    }
}

fn flush_points(
    store: &dyn DocumentStore,
    events: &dyn CoreEventListener,
    metadata: &ChunkMetadata,
    chunk_point_count: usize,
    points: BTreeMap<Timestamp, Value>,
    batch_ids: Option<&BTreeMap<Timestamp, String>>,
) -> Result<WriteResult, PulseError> {
    let started = Instant::now();
    let rate = metadata.sampling_rate;
    let span = chunk_span(chunk_point_count, rate).ok_or_else(|| {
        PulseError::InvalidArgument(format!("chunk span of {} overflows", metadata.id))
    })?;
    let key = SeriesKey {
        safe_path: metadata.safe_path.clone(),
        data_type: metadata.data_type,
        sampling_rate: rate,
    };

    let mut pending: BTreeMap<Timestamp, ChunkAppend> = BTreeMap::new();
    let mut skipped = 0;
    for (ts, value) in points {
        if ts <= 0 {
            skip_point(events, &metadata.path, ts, "non-positive timestamp".to_string());
            skipped += 1;
            continue;
        }
        if value.data_type() != metadata.data_type {
            skip_point(
                events,
                &metadata.path,
                ts,
                format!("{} value in a {} series", value.data_type(), metadata.data_type),
            );
            skipped += 1;
            continue;
        }

        let n_ts = normalize(ts, rate);
        let Some((ts_start, ts_end)) = chunk_bounds(n_ts, span) else {
            skip_point(events, &metadata.path, ts, "chunk window past i64::MAX".to_string());
            skipped += 1;
            continue;
        };
        let append = pending.entry(ts_start).or_insert_with(|| ChunkAppend {
            collection: metadata.collection.clone(),
            key: key.chunk(ts_start),
            ts_end,
            timestamps: Vec::new(),
            values: Vec::new(),
            batch_ids: Vec::new(),
        });
        append.timestamps.push(n_ts);
        append.values.push(value);
        append
            .batch_ids
            .push(batch_ids.and_then(|b| b.get(&ts).cloned()));
    }

    let chunks = pending.len();
    let mut written = 0;
    for append in pending.into_values() {
        written += append.len();
        store.append_chunk(append)?;
    }

    if chunks > 0 {
        events.on_event(CoreEvent::ChunksFlushed {
            series: metadata.id.clone(),
            chunks,
            points: written,
        });
    }
    let elapsed = started.elapsed();
    db_metrics::record_write(elapsed, written as u64, skipped as u64);
    Ok(WriteResult {
        chunks,
        points: written,
        skipped,
        elapsed,
    })
}

fn skip_point(events: &dyn CoreEventListener, path: &str, timestamp: Timestamp, reason: String) {
    let err = PulseError::SkippableData {
        path: path.to_string(),
        timestamp,
        reason: reason.clone(),
    };
    tracing::warn!(error = %err, "skipping data point");
    events.on_event(CoreEvent::PointSkipped {
        path: path.to_string(),
        timestamp,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use futures::executor::block_on;
    use std::thread;

    fn writer() -> (Arc<MemoryDocumentStore>, ChunkWriter) {
        let store = Arc::new(MemoryDocumentStore::new());
        let writer = ChunkWriter::new(store.clone(), &CoreConfig::default()).unwrap();
        (store, writer)
    }

    #[test]
    fn test_register_series_validation() {
        let (_, writer) = writer();
        assert!(matches!(
            writer.register_series("g", "", DataType::Double, 1000),
            Err(PulseError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.register_series("g", "temp", DataType::Double, 1),
            Err(PulseError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.register_series("g", "temp", DataType::Double, 0),
            Err(PulseError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.register_series("g", "temp", DataType::Double, i64::MAX / 2),
            Err(PulseError::InvalidArgument(_))
        ));

        let meta = writer
            .register_series("boilers", "site/temp 1", DataType::Double, 1000)
            .unwrap();
        assert_eq!(meta.safe_path, "site_temp_1");
        assert_eq!(meta.collection, "PulseChunks_boilers_DOUBLE_1000");
        assert_eq!(meta.id, "site_temp_1_DOUBLE_1000");
    }

    #[test]
    fn test_concurrent_registration_yields_one_record() {
        let (store, writer) = writer();
        let writer = Arc::new(writer);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    writer
                        .register_series("g", "line/pressure", DataType::Long, 500)
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(store.metadata_count().unwrap(), 1);
        assert!(results.iter().all(|m| m.id == results[0].id));
    }

    #[test]
    fn test_write_routes_points_into_chunks() {
        let (store, writer) = writer();
        let meta = writer
            .register_series("g", "temp", DataType::Double, 1000)
            .unwrap();

        let mut points = BTreeMap::new();
        points.insert(1_500_000, Value::Double(1.0));
        points.insert(1_500_999, Value::Double(1.5)); // normalizes onto 1_500_000
        points.insert(2_048_000, Value::Double(2.0)); // next chunk
        let result = block_on(writer.write_async(meta.clone(), points, None)).unwrap();

        assert_eq!(result.chunks, 2);
        assert_eq!(result.points, 3);
        assert_eq!(result.skipped, 0);

        let chunks = store
            .range_query(&meta.collection, &[meta.safe_path.clone()], 0, 4_096_000)
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ts_start, 1_024_000);
        assert_eq!(chunks[0].ts_end, 2_048_000);
        assert_eq!(chunks[0].timestamps, vec![1_500_000, 1_500_000]);
        assert_eq!(chunks[1].timestamps, vec![2_048_000]);
        for c in &chunks {
            assert!(c.timestamps.iter().all(|ts| ts % 1000 == 0));
            assert!(c.timestamps.iter().all(|ts| *ts >= c.ts_start && *ts < c.ts_end));
        }
    }

    #[test]
    fn test_bad_points_are_skipped_not_fatal() {
        let (store, writer) = writer();
        let meta = writer
            .register_series("g", "temp", DataType::Double, 1000)
            .unwrap();

        let mut points = BTreeMap::new();
        points.insert(0, Value::Double(1.0));
        points.insert(-5000, Value::Double(1.0));
        points.insert(5000, Value::Text("oops".into()));
        points.insert(6000, Value::Double(6.0));
        points.insert(i64::MAX - 10, Value::Double(7.0));
        let result = block_on(writer.write_async(meta.clone(), points, None)).unwrap();

        assert_eq!(result.skipped, 4);
        assert_eq!(result.points, 1);
        let chunks = store
            .range_query(&meta.collection, &[meta.safe_path.clone()], 0, 1_024_000)
            .unwrap();
        assert_eq!(chunks[0].values, vec![Value::Double(6.0)]);
    }

    #[test]
    fn test_batch_ids_follow_points() {
        let (store, writer) = writer();
        let meta = writer
            .register_series("g", "flow", DataType::Long, 1000)
            .unwrap();

        let points: BTreeMap<_, _> = [(1000, Value::Long(1)), (2000, Value::Long(2))].into();
        let batches: BTreeMap<_, _> = [(2000, "replay-7".to_string())].into();
        block_on(writer.write_async(meta.clone(), points, Some(batches))).unwrap();

        let chunks = store
            .range_query(&meta.collection, &[meta.safe_path.clone()], 0, 1_024_000)
            .unwrap();
        assert_eq!(chunks[0].batch_ids, vec![None, Some("replay-7".to_string())]);
    }
}
