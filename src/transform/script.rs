use crate::types::{Timestamp, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Result of one script evaluation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptOutcome {
    pub ok: bool,
    pub result: Option<Value>,
    pub log_output: Vec<String>,
}

impl ScriptOutcome {
    pub fn success(result: Value) -> Self {
        ScriptOutcome {
            ok: true,
            result: Some(result),
            log_output: Vec::new(),
        }
    }

    pub fn failure(message: &str) -> Self {
        ScriptOutcome {
            ok: false,
            result: None,
            log_output: vec![message.to_string()],
        }
    }
}

/// Opaque script engine. Implementations own their sandboxing.
pub trait ScriptEvaluator: std::fmt::Debug + Send + Sync + 'static {
    fn evaluate(
        &self,
        eval_timestamp: Timestamp,
        script: &str,
        matrix: &DependencyMatrix,
        current: &Value,
        log_context: &str,
    ) -> ScriptOutcome;
}

/// Evaluator installed when no script engine is configured; every evaluation fails.
#[derive(Debug, Default)]
pub struct NoScriptEngine;

impl ScriptEvaluator for NoScriptEngine {
    fn evaluate(
        &self,
        _eval_timestamp: Timestamp,
        _script: &str,
        _matrix: &DependencyMatrix,
        _current: &Value,
        log_context: &str,
    ) -> ScriptOutcome {
        ScriptOutcome::failure(&format!("{}: no script engine configured", log_context))
    }
}

/// Dependency values of one measure, keyed by upstream path, as seen by a script.
#[derive(Debug)]
pub struct DependencyMatrix {
    series: BTreeMap<String, BTreeMap<Timestamp, Value>>,
    log: Mutex<VecDeque<String>>,
    log_capacity: usize,
}

impl DependencyMatrix {
    pub fn new(log_capacity: usize) -> Self {
        DependencyMatrix {
            series: BTreeMap::new(),
            log: Mutex::new(VecDeque::with_capacity(log_capacity.min(64))),
            log_capacity,
        }
    }

    pub fn insert(&mut self, path: &str, timestamp: Timestamp, value: Value) {
        self.series
            .entry(path.to_string())
            .or_default()
            .insert(timestamp, value);
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Known timestamps of `path`, ascending.
    pub fn timestamps(&self, path: &str) -> Vec<Timestamp> {
        self.series
            .get(path)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Value of `path` closest in time to `target`; the earlier point wins a tie.
    pub fn nearest(&self, path: &str, target: Timestamp) -> Option<&Value> {
        let series = self.series.get(path)?;
        let before = series.range(..=target).next_back();
        let after = series.range(target..).next();
        match (before, after) {
            (Some((tb, vb)), Some((ta, va))) => {
                if target - tb <= ta - target {
                    Some(vb)
                } else {
                    Some(va)
                }
            }
            (Some((_, v)), None) | (None, Some((_, v))) => Some(v),
            (None, None) => None,
        }
    }

    /// `path` aligned onto `targets` as numbers.
    pub fn numeric_series(&self, path: &str, targets: &[Timestamp]) -> Vec<Option<f64>> {
        targets
            .iter()
            .map(|&t| self.nearest(path, t).and_then(Value::as_f64))
            .collect()
    }

    pub fn boolean_series(&self, path: &str, targets: &[Timestamp]) -> Vec<Option<bool>> {
        targets
            .iter()
            .map(|&t| self.nearest(path, t).and_then(Value::as_bool))
            .collect()
    }

    pub fn string_series(&self, path: &str, targets: &[Timestamp]) -> Vec<Option<String>> {
        targets
            .iter()
            .map(|&t| self.nearest(path, t).map(Value::as_text))
            .collect()
    }

    /// Appends a line to the rolling log, dropping the oldest line when full.
    pub fn log(&self, line: impl Into<String>) {
        let Ok(mut log) = self.log.lock() else {
            return;
        };
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(line.into());
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> DependencyMatrix {
        let mut m = DependencyMatrix::new(3);
        m.insert("temp", 1000, Value::Double(10.0));
        m.insert("temp", 3000, Value::Double(30.0));
        m.insert("on", 1000, Value::Boolean(true));
        m
    }

    #[test]
    fn test_nearest_neighbour_alignment() {
        let m = matrix();
        assert_eq!(m.timestamps("temp"), vec![1000, 3000]);
        assert_eq!(
            m.numeric_series("temp", &[0, 1400, 2000, 2600, 9000]),
            vec![Some(10.0), Some(10.0), Some(10.0), Some(30.0), Some(30.0)]
        );
        assert_eq!(m.boolean_series("on", &[5000]), vec![Some(true)]);
        assert_eq!(m.string_series("temp", &[3000]), vec![Some("30".to_string())]);
        assert_eq!(m.numeric_series("missing", &[1000]), vec![None]);
    }

    #[test]
    fn test_log_is_bounded() {
        let m = matrix();
        for i in 0..5 {
            m.log(format!("line {}", i));
        }
        assert_eq!(m.log_lines(), vec!["line 2", "line 3", "line 4"]);
    }
}
