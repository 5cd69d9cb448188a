//! Dependency-ordered measure transformation.
//!
//! A run takes the channel samples that changed in one polling cycle, finds every measure
//! they impact, and evaluates those measures as a graph of shared futures on a bounded
//! pool: each measure starts once all of its upstream measures have resolved.

pub mod graph;
pub mod script;

use crate::chunk::MEASURES_GROUP;
use crate::config::CoreConfig;
use crate::error::PulseError;
use crate::measure::{LatestValues, Measure, SourceType, TransformType};
use crate::telemetry::{
    db_metrics, AlarmTransition, AlarmTransitionHook, CoreEvent, CoreEventListener,
};
use crate::types::{Sample, Timestamp, Value};
use crate::writer::ChunkWriter;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::executor::{block_on, ThreadPool};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use futures::task::SpawnExt;
use graph::DependencyGraph;
use script::{DependencyMatrix, ScriptEvaluator};
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// One execution request for the transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerRun {
    pub group_code: String,
    /// Channel samples that changed in this cycle.
    pub samples: Vec<Sample>,
    /// Highest timestamp among `samples`; every output is stamped with it.
    pub tms: Timestamp,
    /// Sampling rate given to the measure series this run writes.
    pub interval: i64,
}

impl TransformerRun {
    pub fn new(group_code: &str, samples: Vec<Sample>, interval: i64) -> Result<Self, PulseError> {
        if interval <= 1 {
            return Err(PulseError::InvalidArgument(format!(
                "run interval must be greater than 1, got {}",
                interval
            )));
        }
        let Some(tms) = samples.iter().map(|s| s.timestamp).max() else {
            return Err(PulseError::InvalidArgument(format!(
                "transformer run for {} has no samples",
                group_code
            )));
        };
        Ok(TransformerRun {
            group_code: group_code.to_string(),
            samples,
            tms,
            interval,
        })
    }
}

/// Last processed `tms` per group. Owned by the caller and shared across runs.
#[derive(Debug, Default)]
pub struct RunGuard {
    last: DashMap<String, Timestamp>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `tms` for `group_code`. Returns `false` if it was already the last one.
    pub fn try_advance(&self, group_code: &str, tms: Timestamp) -> bool {
        match self.last.entry(group_code.to_string()) {
            Entry::Occupied(mut e) => {
                if *e.get() == tms {
                    return false;
                }
                e.insert(tms);
                true
            }
            Entry::Vacant(e) => {
                e.insert(tms);
                true
            }
        }
    }

    pub fn last_processed(&self, group_code: &str) -> Option<Timestamp> {
        self.last.get(group_code).map(|t| *t.value())
    }
}

type MeasureFuture = Shared<BoxFuture<'static, Value>>;

/// An upstream value that is either known now or produced by another measure of the run.
enum Dependency {
    Ready(String, Timestamp, Value),
    Pending(String, MeasureFuture),
}

/// State each measure task needs, shared across the run.
#[derive(Debug)]
struct EvalContext {
    evaluator: Arc<dyn ScriptEvaluator>,
    events: Arc<dyn CoreEventListener>,
    script_log_capacity: usize,
    tms: Timestamp,
}

/// Executes measure graphs and publishes their results through the chunk writer.
#[derive(Debug)]
pub struct Transformer {
    writer: Arc<ChunkWriter>,
    evaluator: Arc<dyn ScriptEvaluator>,
    pool: ThreadPool,
    script_log_capacity: usize,
    events: Arc<dyn CoreEventListener>,
    alarm_hook: Arc<dyn AlarmTransitionHook>,
}

impl Transformer {
    pub fn new(
        writer: Arc<ChunkWriter>,
        evaluator: Arc<dyn ScriptEvaluator>,
        config: &CoreConfig,
    ) -> Result<Self, PulseError> {
        config.validate()?;
        let pool = ThreadPool::builder()
            .pool_size(config.transform_workers)
            .name_prefix("pulse-transform-")
            .create()?;
        Ok(Transformer {
            writer,
            evaluator,
            pool,
            script_log_capacity: config.script_log_capacity,
            events: Arc::clone(&config.event_listener),
            alarm_hook: Arc::clone(&config.alarm_hook),
        })
    }

    /// Recomputes every measure impacted by `run` and publishes one sample per measure.
    ///
    /// Returns the published samples in execution order. A run whose `tms` equals the last
    /// one processed for its group does nothing and returns an empty list. A measure that
    /// fails to evaluate is published with its type's zero value.
    ///
    /// # Errors
    /// * `CycleDetected` if any impacted measure depends on itself; nothing is published.
    /// * Errors from registering or writing the measure series.
    pub fn run_transform(
        &self,
        run: &TransformerRun,
        measures: &[Measure],
        latest: &LatestValues,
        guard: &RunGuard,
    ) -> Result<Vec<Sample>, PulseError> {
        if !guard.try_advance(&run.group_code, run.tms) {
            tracing::debug!(group = %run.group_code, tms = run.tms, "duplicate transformer run skipped");
            self.events.on_event(CoreEvent::TransformRunSkipped {
                group_code: run.group_code.clone(),
                tms: run.tms,
            });
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let mut changed: HashMap<&str, &Sample> = HashMap::new();
        for sample in &run.samples {
            let newer = changed
                .get(sample.path.as_str())
                .map_or(true, |s| sample.timestamp >= s.timestamp);
            if newer {
                changed.insert(sample.path.as_str(), sample);
            }
        }

        let graph = DependencyGraph::new(measures);
        let impacted = graph.impacted(changed.keys());
        if let Some(path) = graph.find_cycle(&impacted) {
            tracing::error!(group = %run.group_code, measure = path, "measure dependency cycle, run aborted");
            self.events.on_event(CoreEvent::TransformRunAborted {
                group_code: run.group_code.clone(),
                path: path.to_string(),
            });
            return Err(PulseError::CycleDetected {
                path: path.to_string(),
            });
        }
        let order = graph.topological_order(&impacted);

        let ctx = Arc::new(EvalContext {
            evaluator: Arc::clone(&self.evaluator),
            events: Arc::clone(&self.events),
            script_log_capacity: self.script_log_capacity,
            tms: run.tms,
        });

        let mut futures: HashMap<&str, MeasureFuture> = HashMap::with_capacity(order.len());
        let mut ordered = Vec::with_capacity(order.len());
        for &path in &order {
            let Some(measure) = graph.measure(path) else {
                continue;
            };
            let deps = resolve_dependencies(measure, &futures, &changed, latest);
            let current = latest
                .get(path)
                .map(|s| s.value)
                .unwrap_or_else(|| measure.data_type.zero_value());
            let task = evaluate_when_ready(Arc::clone(&ctx), measure.clone(), deps, current);
            let handle = self.pool.spawn_with_handle(task).map_err(|e| {
                PulseError::BackgroundTaskError(format!("transform pool refused task: {}", e))
            })?;
            let shared = handle.boxed().shared();
            futures.insert(path, shared.clone());
            ordered.push((measure, shared));
        }

        let values = block_on(join_all(ordered.iter().map(|(_, f)| f.clone())));
        let results: Vec<(&Measure, Sample)> = ordered
            .iter()
            .zip(values)
            .map(|((measure, _), value)| {
                (*measure, Sample::new(MEASURES_GROUP, &measure.path, run.tms, value))
            })
            .collect();

        for (measure, sample) in &results {
            self.raise_alarm(measure, sample, latest);
        }

        let published: Vec<Sample> = results.into_iter().map(|(_, s)| s).collect();
        self.publish(run, measures, &published)?;
        for sample in &published {
            latest.publish(sample.clone());
        }

        db_metrics::record_transform_run(started.elapsed());
        self.events.on_event(CoreEvent::TransformRunCompleted {
            group_code: run.group_code.clone(),
            measures: published.len(),
        });
        Ok(published)
    }

    fn raise_alarm(&self, measure: &Measure, sample: &Sample, latest: &LatestValues) {
        let Some(alarm_id) = measure.alarm_id() else {
            return;
        };
        let Value::Boolean(current) = sample.value else {
            return;
        };
        let previous = latest
            .get(&measure.path)
            .map(|s| s.value)
            .unwrap_or(Value::Boolean(false));
        if previous != Value::Boolean(current) {
            tracing::info!(alarm = alarm_id, measure = %measure.path, active = current, "alarm transition");
            self.alarm_hook.on_alarm_transition(AlarmTransition {
                alarm_id: alarm_id.to_string(),
                path: measure.path.clone(),
                timestamp: sample.timestamp,
                previous,
                current: sample.value.clone(),
            });
        }
    }

    /// Writes each measure sample into its series in the synthetic measures group.
    fn publish(
        &self,
        run: &TransformerRun,
        measures: &[Measure],
        published: &[Sample],
    ) -> Result<(), PulseError> {
        let types: HashMap<&str, _> = measures.iter().map(|m| (m.path.as_str(), m.data_type)).collect();

        let mut by_path: BTreeMap<&str, BTreeMap<Timestamp, Value>> = BTreeMap::new();
        for sample in published {
            by_path
                .entry(sample.path.as_str())
                .or_default()
                .insert(sample.timestamp, sample.value.clone());
        }

        let mut writes = Vec::with_capacity(by_path.len());
        for (path, points) in by_path {
            let Some(&data_type) = types.get(path) else {
                continue;
            };
            let metadata = self
                .writer
                .register_series(MEASURES_GROUP, path, data_type, run.interval)?;
            writes.push(self.writer.write_async(metadata, points, None));
        }
        for result in block_on(join_all(writes)) {
            result?;
        }
        Ok(())
    }
}

fn resolve_dependencies(
    measure: &Measure,
    futures: &HashMap<&str, MeasureFuture>,
    changed: &HashMap<&str, &Sample>,
    latest: &LatestValues,
) -> Vec<Dependency> {
    let mut deps = Vec::with_capacity(measure.upstreams.len());
    for upstream in &measure.upstreams {
        let path = upstream.path.as_str();
        if upstream.source_type == SourceType::Measure {
            if let Some(fut) = futures.get(path) {
                deps.push(Dependency::Pending(path.to_string(), fut.clone()));
                continue;
            }
        }
        if let Some(sample) = changed.get(path) {
            deps.push(Dependency::Ready(path.to_string(), sample.timestamp, sample.value.clone()));
        } else if let Some(sample) = latest.get(path) {
            deps.push(Dependency::Ready(path.to_string(), sample.timestamp, sample.value));
        } else {
            tracing::debug!(measure = %measure.path, upstream = path, "upstream has no value yet");
        }
    }
    deps
}

/// Waits for upstream measures, then evaluates. Always resolves to a value of the
/// measure's declared type.
async fn evaluate_when_ready(
    ctx: Arc<EvalContext>,
    measure: Measure,
    deps: Vec<Dependency>,
    current: Value,
) -> Value {
    let mut resolved = Vec::with_capacity(deps.len());
    for dep in deps {
        match dep {
            Dependency::Ready(path, ts, value) => resolved.push((path, ts, value)),
            Dependency::Pending(path, fut) => resolved.push((path, ctx.tms, fut.await)),
        }
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        compute_measure(&ctx, &measure, &resolved, &current)
    }))
    .unwrap_or_else(|_| {
        Err(PulseError::MeasureEvaluationFailed {
            path: measure.path.clone(),
            reason: "evaluation panicked".to_string(),
        })
    });

    let zero = measure.data_type.zero_value();
    match outcome {
        Ok(value) => value.coerce(measure.data_type).unwrap_or_else(|e| {
            tracing::warn!(measure = %measure.path, error = %e, "result coercion failed, publishing zero value");
            zero
        }),
        Err(e) => {
            if let PulseError::ScriptEvaluationFailed { log_output, .. } = &e {
                for line in log_output {
                    tracing::debug!(measure = %measure.path, "{}", line);
                }
            }
            tracing::warn!(measure = %measure.path, error = %e, "measure degraded to zero value");
            db_metrics::record_measure_degraded();
            ctx.events.on_event(CoreEvent::MeasureDegraded {
                path: measure.path.clone(),
                error: e.to_string(),
            });
            zero
        }
    }
}

fn compute_measure(
    ctx: &EvalContext,
    measure: &Measure,
    deps: &[(String, Timestamp, Value)],
    current: &Value,
) -> Result<Value, PulseError> {
    let failed = |reason: String| PulseError::MeasureEvaluationFailed {
        path: measure.path.clone(),
        reason,
    };
    let values = deps.iter().map(|(_, _, v)| v);
    let computed = match measure.transform_type {
        TransformType::CopyLatest => deps.first().map(|(_, _, v)| v.clone()),
        TransformType::MinLatest => Value::min_of(values).map_err(|e| failed(e.to_string()))?.cloned(),
        TransformType::MaxLatest => Value::max_of(values).map_err(|e| failed(e.to_string()))?.cloned(),
        TransformType::SumLatest => Value::sum_of(values).map_err(|e| failed(e.to_string()))?,
        TransformType::AvgLatest => Value::mean_of(values).map_err(|e| failed(e.to_string()))?,
        TransformType::Javascript => return evaluate_script(ctx, measure, deps, current),
    };
    computed.ok_or_else(|| failed("no dependency values".to_string()))
}

fn evaluate_script(
    ctx: &EvalContext,
    measure: &Measure,
    deps: &[(String, Timestamp, Value)],
    current: &Value,
) -> Result<Value, PulseError> {
    let script_failed = |reason: &str, log_output: Vec<String>| PulseError::ScriptEvaluationFailed {
        path: measure.path.clone(),
        reason: reason.to_string(),
        log_output,
    };
    let Some(script) = measure.script() else {
        return Err(script_failed("measure has no script", Vec::new()));
    };

    let mut matrix = DependencyMatrix::new(ctx.script_log_capacity);
    for (path, ts, value) in deps {
        matrix.insert(path, *ts, value.clone());
    }
    let log_context = format!("{}@{}", measure.path, ctx.tms);
    let outcome = ctx
        .evaluator
        .evaluate(ctx.tms, script, &matrix, current, &log_context);

    let mut log_output = matrix.log_lines();
    log_output.extend(outcome.log_output);
    match (outcome.ok, outcome.result) {
        (true, Some(value)) => Ok(value),
        (true, None) => Err(script_failed("script returned no value", log_output)),
        (false, _) => Err(script_failed("script reported failure", log_output)),
    }
}
