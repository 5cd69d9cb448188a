//! One polling cycle: connector samples into accumulators and chunks, and the resulting
//! transformer run.

use crate::accumulator::{window_for, Accumulator, AggregateOp, AccumulatorRegistry};
use crate::connector::{ChannelsByGroup, Connector};
use crate::error::PulseError;
use crate::measure::LatestValues;
use crate::telemetry::db_metrics;
use crate::transform::TransformerRun;
use crate::types::{DataType, Sample, Timestamp, Value};
use crate::writer::ChunkWriter;
use futures::executor::block_on;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Window aggregation applied to a channel before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregation {
    pub op: AggregateOp,
    /// Window length in milliseconds.
    pub time_base: i64,
}

/// How one channel is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub path: String,
    pub data_type: DataType,
    pub sampling_rate: i64,
    pub aggregation: Option<Aggregation>,
}

impl ChannelSpec {
    pub fn new(path: &str, data_type: DataType, sampling_rate: i64) -> Self {
        ChannelSpec {
            path: path.to_string(),
            data_type,
            sampling_rate,
            aggregation: None,
        }
    }

    pub fn aggregated(mut self, op: AggregateOp, time_base: i64) -> Self {
        self.aggregation = Some(Aggregation { op, time_base });
        self
    }
}

/// Points for one channel gathered during a cycle.
#[derive(Default)]
struct PendingWrite {
    points: BTreeMap<Timestamp, Value>,
    batch_ids: BTreeMap<Timestamp, String>,
}

impl PendingWrite {
    fn add(&mut self, sample: &Sample) {
        self.points.insert(sample.timestamp, sample.value.clone());
        if let Some(batch) = &sample.batch_id {
            self.batch_ids.insert(sample.timestamp, batch.clone());
        }
    }
}

/// Drives the write side for the channels of each group.
#[derive(Debug)]
pub struct Ingestor {
    writer: Arc<ChunkWriter>,
    accumulators: Arc<AccumulatorRegistry>,
    latest: Arc<LatestValues>,
    /// group -> path -> spec
    channels: BTreeMap<String, BTreeMap<String, ChannelSpec>>,
    interval: i64,
}

impl Ingestor {
    /// `interval` is handed to the transformer runs this ingestor produces.
    pub fn new(
        writer: Arc<ChunkWriter>,
        accumulators: Arc<AccumulatorRegistry>,
        latest: Arc<LatestValues>,
        interval: i64,
    ) -> Result<Self, PulseError> {
        if interval <= 1 {
            return Err(PulseError::InvalidArgument(format!(
                "ingest interval must be greater than 1, got {}",
                interval
            )));
        }
        Ok(Ingestor {
            writer,
            accumulators,
            latest,
            channels: BTreeMap::new(),
            interval,
        })
    }

    pub fn add_channel(&mut self, group_code: &str, spec: ChannelSpec) -> Result<(), PulseError> {
        if let Some(agg) = &spec.aggregation {
            if agg.time_base <= 0 {
                return Err(PulseError::InvalidArgument(format!(
                    "aggregation time base of {} must be positive",
                    spec.path
                )));
            }
        }
        self.channels
            .entry(group_code.to_string())
            .or_default()
            .insert(spec.path.clone(), spec);
        Ok(())
    }

    /// Channels to request from the connector.
    pub fn channels_by_group(&self) -> ChannelsByGroup {
        self.channels
            .iter()
            .map(|(group, specs)| (group.clone(), specs.keys().cloned().collect()))
            .collect()
    }

    /// Queries `connector` for every configured channel and ingests the answer per group.
    pub fn poll(&self, connector: &dyn Connector) -> Result<Vec<TransformerRun>, PulseError> {
        let samples = block_on(connector.query(&self.channels_by_group()))?;
        let mut by_group: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
        for sample in samples {
            by_group.entry(sample.group_code.clone()).or_default().push(sample);
        }

        let mut runs = Vec::new();
        for (group, samples) in by_group {
            if let Some(run) = self.ingest(&group, samples)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    /// Stores one batch of samples for `group_code`.
    ///
    /// Plain channels are written as they come. Aggregated channels are pushed into their
    /// windows; every window that ended at or before the newest timestamp seen for the
    /// channel is reduced and written. A closed window leaves the registry only once its
    /// write succeeded, so a failed cycle (e.g. `Backpressure`) is retried by the next one.
    /// Returns the run describing what changed, or `None` when nothing was published.
    pub fn ingest(
        &self,
        group_code: &str,
        samples: Vec<Sample>,
    ) -> Result<Option<TransformerRun>, PulseError> {
        let Some(specs) = self.channels.get(group_code) else {
            tracing::warn!(group = group_code, samples = samples.len(), "samples for unknown group dropped");
            return Ok(None);
        };

        let mut pending: BTreeMap<&str, PendingWrite> = BTreeMap::new();
        let mut published: Vec<Sample> = Vec::new();
        let mut newest: BTreeMap<&str, Timestamp> = BTreeMap::new();

        for sample in samples {
            let Some(spec) = specs.get(&sample.path) else {
                tracing::warn!(group = group_code, path = %sample.path, "sample for unknown channel dropped");
                continue;
            };
            match spec.aggregation {
                Some(agg) => {
                    let (start, end) = match window_for(sample.timestamp, agg.time_base) {
                        Ok(window) => window,
                        Err(e) => {
                            tracing::warn!(path = %sample.path, ts = sample.timestamp, error = %e, "sample outside any window dropped");
                            continue;
                        }
                    };
                    let acc = self
                        .accumulators
                        .get_or_create(group_code, &spec.path, start, end)?;
                    let ts = newest.entry(spec.path.as_str()).or_insert(sample.timestamp);
                    *ts = (*ts).max(sample.timestamp);
                    self.accumulators.push(&acc, sample)?;
                }
                None => {
                    pending.entry(spec.path.as_str()).or_default().add(&sample);
                    published.push(sample);
                }
            }
        }

        // Closed windows whose aggregate is part of this cycle's writes.
        let mut closed: BTreeMap<&str, Vec<Arc<Accumulator>>> = BTreeMap::new();
        for (path, tms) in newest {
            let Some(agg) = specs.get(path).and_then(|s| s.aggregation) else {
                continue;
            };
            let mut settled = Vec::new();
            for acc in self.accumulators.find_completed(group_code, path, tms) {
                match self.accumulators.aggregate(&acc, agg.op) {
                    Ok(Some(sample)) => {
                        pending.entry(path).or_default().add(&sample);
                        published.push(sample);
                        closed.entry(path).or_default().push(acc);
                    }
                    Ok(None) => settled.push(acc),
                    Err(e) => {
                        tracing::warn!(path, window_end = acc.window_end(), error = %e, "window aggregation failed, window dropped");
                        settled.push(acc);
                    }
                }
            }
            self.accumulators.remove(&settled);
        }

        let mut targets = Vec::with_capacity(pending.len());
        for (path, write) in pending {
            let Some(spec) = specs.get(path) else {
                continue;
            };
            let metadata =
                self.writer
                    .register_series(group_code, path, spec.data_type, spec.sampling_rate)?;
            targets.push((path, metadata, write));
        }

        let mut paths = Vec::with_capacity(targets.len());
        let mut writes = Vec::with_capacity(targets.len());
        for (path, metadata, write) in targets {
            let batch_ids = (!write.batch_ids.is_empty()).then_some(write.batch_ids);
            paths.push(path);
            writes.push(self.writer.write_async(metadata, write.points, batch_ids));
        }

        let mut failure = None;
        for (path, result) in paths.into_iter().zip(block_on(join_all(writes))) {
            match result {
                Ok(_) => {
                    if let Some(done) = closed.remove(path) {
                        self.accumulators.remove(&done);
                    }
                }
                Err(e) => {
                    tracing::warn!(group = group_code, path, error = %e, "ingest write failed, closed windows kept");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        if published.is_empty() {
            return Ok(None);
        }
        let changed: BTreeSet<&str> = published.iter().map(|s| s.path.as_str()).collect();
        tracing::debug!(group = group_code, channels = changed.len(), "ingest cycle published");
        db_metrics::record_ingest(published.len() as u64);
        for sample in &published {
            self.latest.publish(sample.clone());
        }
        TransformerRun::new(group_code, published, self.interval).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SeriesKey;
    use crate::config::CoreConfig;
    use crate::store::{ChunkAppend, DocumentStore, MemoryDocumentStore};
    use crate::types::{Chunk, ChunkMetadata};
    use std::sync::mpsc;
    use std::sync::Mutex;

    /// Store whose first append parks the calling worker until the test lets it go.
    #[derive(Debug)]
    struct GatedStore {
        inner: MemoryDocumentStore,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl DocumentStore for GatedStore {
        fn upsert_metadata_if_absent(
            &self,
            key: &SeriesKey,
            on_insert: ChunkMetadata,
        ) -> Result<ChunkMetadata, PulseError> {
            self.inner.upsert_metadata_if_absent(key, on_insert)
        }

        fn append_chunk(&self, append: ChunkAppend) -> Result<(), PulseError> {
            if let Some(entered) = self.entered.lock().unwrap().take() {
                entered.send(()).unwrap();
                let gate = self.gate.lock().unwrap().take().unwrap();
                gate.recv().unwrap();
            }
            self.inner.append_chunk(append)
        }

        fn range_query(
            &self,
            collection: &str,
            safe_paths: &[String],
            ts_start: Timestamp,
            ts_end: Timestamp,
        ) -> Result<Vec<Chunk>, PulseError> {
            self.inner.range_query(collection, safe_paths, ts_start, ts_end)
        }

        fn find_all_metadata(&self) -> Result<Vec<ChunkMetadata>, PulseError> {
            self.inner.find_all_metadata()
        }

        fn find_metadata_by_key(&self, key: &SeriesKey) -> Result<Option<ChunkMetadata>, PulseError> {
            self.inner.find_metadata_by_key(key)
        }
    }

    fn ingestor() -> (Arc<MemoryDocumentStore>, Arc<AccumulatorRegistry>, Ingestor) {
        let store = Arc::new(MemoryDocumentStore::new());
        let writer = Arc::new(ChunkWriter::new(store.clone(), &CoreConfig::default()).unwrap());
        let accumulators = Arc::new(AccumulatorRegistry::new());
        let latest = Arc::new(LatestValues::new());
        let mut ingestor = Ingestor::new(writer, accumulators.clone(), latest, 1000).unwrap();
        ingestor
            .add_channel("plant", ChannelSpec::new("temp", DataType::Double, 1000))
            .unwrap();
        ingestor
            .add_channel(
                "plant",
                ChannelSpec::new("flow", DataType::Double, 1000).aggregated(AggregateOp::Sum, 60_000),
            )
            .unwrap();
        (store, accumulators, ingestor)
    }

    #[test]
    fn test_plain_channel_is_written_and_reported() {
        let (store, _, ingestor) = ingestor();
        let run = ingestor
            .ingest("plant", vec![Sample::new("plant", "temp", 5000, Value::Double(21.5))])
            .unwrap()
            .unwrap();
        assert_eq!(run.tms, 5000);
        assert_eq!(run.samples.len(), 1);
        assert_eq!(store.chunk_count("PulseChunks_plant_DOUBLE_1000").unwrap(), 1);
    }

    #[test]
    fn test_aggregated_window_published_once_closed() {
        let (store, accumulators, ingestor) = ingestor();

        let first = ingestor
            .ingest(
                "plant",
                vec![
                    Sample::new("plant", "flow", 10_000, Value::Double(2.5)),
                    Sample::new("plant", "flow", 20_000, Value::Double(3.5)),
                ],
            )
            .unwrap();
        assert!(first.is_none());
        assert_eq!(accumulators.len(), 1);

        let run = ingestor
            .ingest("plant", vec![Sample::new("plant", "flow", 61_000, Value::Double(1.0))])
            .unwrap()
            .unwrap();
        assert_eq!(run.samples.len(), 1);
        assert_eq!(run.samples[0].timestamp, 60_000);
        assert_eq!(run.samples[0].value, Value::Double(6.0));
        // The window that just opened is still pending.
        assert_eq!(accumulators.len(), 1);

        let meta = store.find_all_metadata().unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].path, "flow");
    }

    #[test]
    fn test_unknown_channel_is_ignored() {
        let (_, _, ingestor) = ingestor();
        let run = ingestor
            .ingest("plant", vec![Sample::new("plant", "nope", 1000, Value::Long(1))])
            .unwrap();
        assert!(run.is_none());
        assert!(ingestor.ingest("other", vec![]).unwrap().is_none());
    }

    #[test]
    fn test_closed_window_survives_rejected_write() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: MemoryDocumentStore::new(),
            entered: Mutex::new(Some(entered_tx)),
            gate: Mutex::new(Some(release_rx)),
        });
        let config = CoreConfig {
            write_workers: 1,
            write_queue_capacity: 1,
            ..CoreConfig::default()
        };
        let writer = Arc::new(ChunkWriter::new(store.clone(), &config).unwrap());
        let accumulators = Arc::new(AccumulatorRegistry::new());
        let mut ingestor = Ingestor::new(
            writer.clone(),
            accumulators.clone(),
            Arc::new(LatestValues::new()),
            1000,
        )
        .unwrap();
        ingestor
            .add_channel(
                "plant",
                ChannelSpec::new("flow", DataType::Double, 1000).aggregated(AggregateOp::Sum, 60_000),
            )
            .unwrap();

        ingestor
            .ingest(
                "plant",
                vec![
                    Sample::new("plant", "flow", 10_000, Value::Double(2.5)),
                    Sample::new("plant", "flow", 20_000, Value::Double(3.5)),
                ],
            )
            .unwrap();

        // Park the only worker, then take the only queue slot.
        let other = writer
            .register_series("plant", "other", DataType::Double, 1000)
            .unwrap();
        let parked = writer.write_async(other.clone(), [(1000, Value::Double(1.0))].into(), None);
        entered_rx.recv().unwrap();
        let queued = writer.write_async(other, [(2000, Value::Double(2.0))].into(), None);

        let rejected =
            ingestor.ingest("plant", vec![Sample::new("plant", "flow", 61_000, Value::Double(1.0))]);
        assert!(matches!(rejected, Err(PulseError::Backpressure { .. })));
        // Both the closed [0, 60_000) window and the new one are still held.
        assert_eq!(accumulators.len(), 2);

        release_tx.send(()).unwrap();
        block_on(parked).unwrap();
        block_on(queued).unwrap();

        let run = ingestor
            .ingest("plant", vec![Sample::new("plant", "flow", 62_000, Value::Double(1.0))])
            .unwrap()
            .unwrap();
        assert_eq!(run.samples.len(), 1);
        assert_eq!(run.samples[0].timestamp, 60_000);
        assert_eq!(run.samples[0].value, Value::Double(6.0));
        assert_eq!(accumulators.len(), 1);

        let flow = writer
            .register_series("plant", "flow", DataType::Double, 1000)
            .unwrap();
        let chunks = store
            .range_query(&flow.collection, &[flow.safe_path.clone()], 0, 1_024_000)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].values, vec![Value::Double(6.0)]);
    }
}
