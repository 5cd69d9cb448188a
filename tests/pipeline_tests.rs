//! A full polling cycle: connector -> ingest -> transform -> extract.

use futures::future::{self, BoxFuture, FutureExt};
use pulse_core::connector::ChannelsByGroup;
use pulse_core::*;
use std::sync::{Arc, Mutex};

/// Connector replaying canned samples, one batch per poll.
#[derive(Debug)]
struct ScriptedConnector {
    batches: Mutex<Vec<Vec<Sample>>>,
    requested: Mutex<Vec<ChannelsByGroup>>,
}

impl ScriptedConnector {
    fn new(mut batches: Vec<Vec<Sample>>) -> Self {
        batches.reverse();
        ScriptedConnector {
            batches: Mutex::new(batches),
            requested: Mutex::new(Vec::new()),
        }
    }
}

impl Connector for ScriptedConnector {
    fn query(&self, channels: &ChannelsByGroup) -> BoxFuture<'static, Result<Vec<Sample>, PulseError>> {
        self.requested.lock().unwrap().push(channels.clone());
        let batch = self.batches.lock().unwrap().pop().unwrap_or_default();
        future::ready(Ok(batch)).boxed()
    }
}

#[derive(Debug)]
struct FailingConnector;

impl Connector for FailingConnector {
    fn query(&self, _channels: &ChannelsByGroup) -> BoxFuture<'static, Result<Vec<Sample>, PulseError>> {
        future::ready(Err(PulseError::Io("connection refused".to_string()))).boxed()
    }
}

fn s(path: &str, ts: Timestamp, v: f64) -> Sample {
    Sample::new("plant", path, ts, Value::Double(v))
}

#[test]
fn test_poll_transform_and_read_back() {
    let config = CoreConfig::default();
    let store = Arc::new(MemoryDocumentStore::new());
    let writer = Arc::new(ChunkWriter::new(store.clone(), &config).unwrap());
    let latest = Arc::new(LatestValues::new());
    let accumulators = Arc::new(AccumulatorRegistry::new());
    let engine = ChunkQueryEngine::new(store.clone(), &config).unwrap();
    let transformer = Transformer::new(writer.clone(), Arc::new(NoScriptEngine), &config).unwrap();
    let guard = RunGuard::new();

    let mut ingestor = Ingestor::new(writer, accumulators.clone(), latest.clone(), 1000).unwrap();
    ingestor
        .add_channel("plant", ChannelSpec::new("temp", DataType::Double, 1000))
        .unwrap();
    ingestor
        .add_channel(
            "plant",
            ChannelSpec::new("flow", DataType::Double, 1000).aggregated(AggregateOp::Avg, 10_000),
        )
        .unwrap();

    let measures = vec![
        Measure::new("temp_copy", TransformType::CopyLatest, DataType::Double).with_channel("temp"),
        Measure::new("flow_peak", TransformType::MaxLatest, DataType::Double)
            .with_channel("flow")
            .with_measure("temp_copy"),
    ];

    let connector = ScriptedConnector::new(vec![
        vec![s("temp", 5_000, 20.0), s("flow", 2_000, 1.0), s("flow", 4_000, 3.0)],
        vec![s("temp", 11_000, 21.0), s("flow", 12_000, 5.0)],
    ]);

    let first = ingestor.poll(&connector).unwrap();
    assert_eq!(first.len(), 1);
    let published = transformer
        .run_transform(&first[0], &measures, &latest, &guard)
        .unwrap();
    // Only temp changed: flow's window is still open.
    assert_eq!(published.len(), 2);

    let second = ingestor.poll(&connector).unwrap();
    assert_eq!(second[0].tms, 11_000);
    let published = transformer
        .run_transform(&second[0], &measures, &latest, &guard)
        .unwrap();
    let peak = published.iter().find(|s| s.path == "flow_peak").unwrap();
    // max(flow window avg = 2.0, temp_copy = 21.0)
    assert_eq!(peak.value, Value::Double(21.0));

    let requested = connector.requested.lock().unwrap();
    assert_eq!(requested[0]["plant"], vec!["flow".to_string(), "temp".to_string()]);

    let matrix = engine
        .extract(
            &["temp".to_string(), "flow".to_string(), "temp_copy".to_string()],
            0,
            20_000,
        )
        .unwrap();
    assert_eq!(matrix["plant"]["temp"].len(), 2);
    assert_eq!(matrix["plant"]["flow"][&10_000], Value::Double(2.0));
    assert_eq!(matrix[MEASURES_GROUP]["temp_copy"][&11_000], Value::Double(21.0));
    assert_eq!(accumulators.len(), 1);
}

#[test]
fn test_connector_failure_is_returned() {
    let store = Arc::new(MemoryDocumentStore::new());
    let writer = Arc::new(ChunkWriter::new(store, &CoreConfig::default()).unwrap());
    let ingestor = Ingestor::new(
        writer,
        Arc::new(AccumulatorRegistry::new()),
        Arc::new(LatestValues::new()),
        1000,
    )
    .unwrap();
    assert!(matches!(
        ingestor.poll(&FailingConnector),
        Err(PulseError::Io(_))
    ));
}
