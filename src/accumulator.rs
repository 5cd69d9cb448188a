use crate::chunk::floor_to;
use crate::error::PulseError;
use crate::types::{Sample, Timestamp, Value};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Reduction applied to the samples of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateOp {
    /// Last pushed sample (insertion order, not timestamp order).
    Copy,
    Min,
    Max,
    Sum,
    Avg,
}

/// Identity of one accumulator: `(group, path, [window_start, window_end))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccumulatorKey {
    pub group_code: String,
    pub path: String,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
}

/// Samples collected for one window, in push order.
#[derive(Debug)]
pub struct Accumulator {
    key: AccumulatorKey,
    samples: Mutex<Vec<Sample>>,
}

impl Accumulator {
    fn new(key: AccumulatorKey) -> Self {
        Accumulator {
            key,
            samples: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &AccumulatorKey {
        &self.key
    }

    pub fn window_end(&self) -> Timestamp {
        self.key.window_end
    }

    /// Number of samples collected so far.
    pub fn len(&self) -> Result<usize, PulseError> {
        Ok(self.samples.lock()?.len())
    }
}

/// Returns the `[start, end)` window of length `time_base` containing `ts`.
pub fn window_for(ts: Timestamp, time_base: i64) -> Result<(Timestamp, Timestamp), PulseError> {
    if time_base <= 0 {
        return Err(PulseError::InvalidArgument(format!(
            "aggregation time base must be positive, got {}",
            time_base
        )));
    }
    let start = floor_to(ts, time_base);
    let end = start.checked_add(time_base).ok_or_else(|| {
        PulseError::InvalidArgument(format!(
            "window of {} ms holding {} ends past i64::MAX",
            time_base, ts
        ))
    })?;
    Ok((start, end))
}

/// Concurrent registry of open accumulators.
///
/// Nothing is evicted automatically: owners drain closed windows with
/// [`find_completed`](Self::find_completed) followed by [`remove`](Self::remove).
#[derive(Debug, Default)]
pub struct AccumulatorRegistry {
    accumulators: DashMap<AccumulatorKey, Arc<Accumulator>>,
}

impl AccumulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the accumulator for the window, creating it atomically on first use.
    pub fn get_or_create(
        &self,
        group_code: &str,
        path: &str,
        window_start: Timestamp,
        window_end: Timestamp,
    ) -> Result<Arc<Accumulator>, PulseError> {
        if window_end <= window_start {
            return Err(PulseError::InvalidArgument(format!(
                "empty accumulator window [{}, {}) for {}",
                window_start, window_end, path
            )));
        }
        let key = AccumulatorKey {
            group_code: group_code.to_string(),
            path: path.to_string(),
            window_start,
            window_end,
        };
        let entry = self
            .accumulators
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Accumulator::new(key)));
        Ok(Arc::clone(entry.value()))
    }

    /// Appends `sample` to the accumulator. The value type is not checked here.
    pub fn push(&self, accumulator: &Accumulator, sample: Sample) -> Result<(), PulseError> {
        accumulator.samples.lock()?.push(sample);
        Ok(())
    }

    /// Reduces the accumulator to a single sample stamped with the window end.
    ///
    /// The batch id of the result is taken from the sample with the highest timestamp.
    /// Returns `None` for an empty accumulator.
    ///
    /// # Errors
    /// `UnsupportedOperation` for `Sum`/`Avg` over non-numeric values, or `Min`/`Max` over
    /// values of incomparable types.
    pub fn aggregate(
        &self,
        accumulator: &Accumulator,
        op: AggregateOp,
    ) -> Result<Option<Sample>, PulseError> {
        let samples = accumulator.samples.lock()?;
        let Some(last) = samples.last() else {
            return Ok(None);
        };

        let values = samples.iter().map(|s| &s.value);
        let value: Value = match op {
            AggregateOp::Copy => last.value.clone(),
            AggregateOp::Min => Value::min_of(values)?.cloned().unwrap_or_else(|| last.value.clone()),
            AggregateOp::Max => Value::max_of(values)?.cloned().unwrap_or_else(|| last.value.clone()),
            AggregateOp::Sum => Value::sum_of(values)?.unwrap_or_else(|| last.value.clone()),
            AggregateOp::Avg => Value::mean_of(values)?.unwrap_or_else(|| last.value.clone()),
        };

        let batch_id = samples
            .iter()
            .max_by_key(|s| s.timestamp)
            .and_then(|s| s.batch_id.clone());

        let key = &accumulator.key;
        Ok(Some(Sample {
            group_code: key.group_code.clone(),
            path: key.path.clone(),
            timestamp: key.window_end,
            value,
            batch_id,
        }))
    }

    /// Accumulators of `(group_code, path)` whose window ended at or before `tms_compare`,
    /// ordered by window start. The result is a snapshot; later pushes or removals do not
    /// change it.
    pub fn find_completed(
        &self,
        group_code: &str,
        path: &str,
        tms_compare: Timestamp,
    ) -> Vec<Arc<Accumulator>> {
        let mut completed: Vec<Arc<Accumulator>> = self
            .accumulators
            .iter()
            .filter(|e| {
                let k = e.key();
                k.group_code == group_code && k.path == path && k.window_end <= tms_compare
            })
            .map(|e| Arc::clone(e.value()))
            .collect();
        completed.sort_by_key(|a| a.key.window_start);
        completed
    }

    pub fn remove(&self, accumulators: &[Arc<Accumulator>]) {
        for acc in accumulators {
            self.accumulators.remove(&acc.key);
        }
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }
}
