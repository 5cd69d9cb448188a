use std::sync::Arc;

use crate::types::{Timestamp, Value};

/// Structured, in-process event hook for observability.
///
/// Human-readable diagnostics go through `tracing`; these events are for callers that
/// want to count or forward what the core does (metrics, dashboards, custom sinks).
pub trait CoreEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: CoreEvent);
}

/// Structured events emitted by the core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// Write queue passed half of its capacity (rate limited).
    WriteQueuePressure { queued: usize, capacity: usize },
    WriteRejected { queued: usize, capacity: usize },
    ChunksFlushed { series: String, chunks: usize, points: usize },
    PointSkipped { path: String, timestamp: Timestamp, reason: String },

    ExtractionCompleted { paths: usize, chunks: usize },

    TransformRunSkipped { group_code: String, tms: Timestamp },
    TransformRunAborted { group_code: String, path: String },
    TransformRunCompleted { group_code: String, measures: usize },
    MeasureDegraded { path: String, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl CoreEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: CoreEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn CoreEventListener> {
    Arc::new(NoopEventListener)
}

/// A boolean alarm measure changed value during a transformer run.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmTransition {
    pub alarm_id: String,
    pub path: String,
    pub timestamp: Timestamp,
    pub previous: Value,
    pub current: Value,
}

/// Extension point invoked for every alarm transition.
///
/// The core raises transitions but attaches no side effect of its own; emitting change-log
/// records or notifications is up to the implementation installed here.
pub trait AlarmTransitionHook: std::fmt::Debug + Send + Sync + 'static {
    fn on_alarm_transition(&self, transition: AlarmTransition);
}

#[derive(Debug)]
pub struct NoopAlarmHook;

impl AlarmTransitionHook for NoopAlarmHook {
    #[inline]
    fn on_alarm_transition(&self, _transition: AlarmTransition) {}
}

pub fn noop_alarm_hook() -> Arc<dyn AlarmTransitionHook> {
    Arc::new(NoopAlarmHook)
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Emitting is a no-op until the embedding process installs a recorder; call
/// [`describe_all`](db_metrics::describe_all) once after installing it to attach units and
/// help text.
pub mod db_metrics {
    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
    use std::time::Duration;

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by Prometheus-style exporters.

    pub const INGEST_SAMPLES: &str = "pulse_ingest_samples";
    pub const WRITE_POINTS: &str = "pulse_write_points";
    pub const WRITE_SKIPPED_POINTS: &str = "pulse_write_skipped_points";
    pub const WRITE_DURATION_SECONDS: &str = "pulse_write_duration_seconds";
    pub const WRITE_REJECTED: &str = "pulse_write_rejected";
    pub const WRITE_QUEUE_DEPTH: &str = "pulse_write_queue_depth";

    pub const EXTRACT_CHUNKS: &str = "pulse_extract_chunks";
    pub const EXTRACT_DURATION_SECONDS: &str = "pulse_extract_duration_seconds";

    pub const TRANSFORM_RUNS: &str = "pulse_transform_runs";
    pub const TRANSFORM_DURATION_SECONDS: &str = "pulse_transform_duration_seconds";
    pub const MEASURES_DEGRADED: &str = "pulse_measures_degraded";

    pub const SNAPSHOT_DURATION_SECONDS: &str = "pulse_snapshot_duration_seconds";
    pub const SNAPSHOT_SIZE_BYTES: &str = "pulse_snapshot_size_bytes";

    #[inline]
    pub fn record_ingest(samples: u64) {
        if samples > 0 {
            ::metrics::counter!(INGEST_SAMPLES).increment(samples);
        }
    }

    #[inline]
    pub fn record_write(duration: Duration, points: u64, skipped: u64) {
        ::metrics::histogram!(WRITE_DURATION_SECONDS).record(duration.as_secs_f64());
        if points > 0 {
            ::metrics::counter!(WRITE_POINTS).increment(points);
        }
        if skipped > 0 {
            ::metrics::counter!(WRITE_SKIPPED_POINTS).increment(skipped);
        }
    }

    #[inline]
    pub fn record_write_rejected() {
        ::metrics::counter!(WRITE_REJECTED).increment(1);
    }

    #[inline]
    pub fn record_write_queue_depth(queued: usize) {
        ::metrics::gauge!(WRITE_QUEUE_DEPTH).set(queued as f64);
    }

    #[inline]
    pub fn record_extraction(duration: Duration, chunks: u64) {
        ::metrics::histogram!(EXTRACT_DURATION_SECONDS).record(duration.as_secs_f64());
        if chunks > 0 {
            ::metrics::counter!(EXTRACT_CHUNKS).increment(chunks);
        }
    }

    #[inline]
    pub fn record_transform_run(duration: Duration) {
        ::metrics::counter!(TRANSFORM_RUNS).increment(1);
        ::metrics::histogram!(TRANSFORM_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_measure_degraded() {
        ::metrics::counter!(MEASURES_DEGRADED).increment(1);
    }

    #[inline]
    pub fn record_snapshot(duration: Duration, size_bytes: u64) {
        ::metrics::histogram!(SNAPSHOT_DURATION_SECONDS).record(duration.as_secs_f64());
        ::metrics::gauge!(SNAPSHOT_SIZE_BYTES).set(size_bytes as f64);
    }

    pub fn describe_all() {
        // Counters
        describe_counter!(
            INGEST_SAMPLES,
            Unit::Count,
            "Samples published by ingest cycles (plain points and closed windows)."
        );
        describe_counter!(WRITE_POINTS, Unit::Count, "Points appended to chunks.");
        describe_counter!(
            WRITE_SKIPPED_POINTS,
            Unit::Count,
            "Points dropped by the writer (bad timestamp, mistyped value, chunk past i64::MAX)."
        );
        describe_counter!(
            WRITE_REJECTED,
            Unit::Count,
            "Write tasks refused because the write queue was full."
        );
        describe_counter!(EXTRACT_CHUNKS, Unit::Count, "Chunks read by extractions.");
        describe_counter!(TRANSFORM_RUNS, Unit::Count, "Transformer runs that published measures.");
        describe_counter!(
            MEASURES_DEGRADED,
            Unit::Count,
            "Measure evaluations that failed and were published as zero."
        );

        // Histograms
        describe_histogram!(
            WRITE_DURATION_SECONDS,
            Unit::Seconds,
            "Time a write task spent bucketing and appending on a pool worker."
        );
        describe_histogram!(
            EXTRACT_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end duration of ChunkQueryEngine::extract."
        );
        describe_histogram!(
            TRANSFORM_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end duration of a completed transformer run, publishing included."
        );
        describe_histogram!(
            SNAPSHOT_DURATION_SECONDS,
            Unit::Seconds,
            "Time to create and durably install a snapshot."
        );

        // Gauges
        describe_gauge!(
            WRITE_QUEUE_DEPTH,
            Unit::Count,
            "Write tasks waiting for a worker, sampled on submit."
        );
        describe_gauge!(
            SNAPSHOT_SIZE_BYTES,
            Unit::Bytes,
            "Size of the most recently created snapshot file."
        );
    }

}
