use crate::types::{DataType, Sample};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Detail key holding the script body of a `Javascript` measure.
pub const SCRIPT_DETAIL: &str = "script";
/// Detail key marking a measure as an alarm; the value is the alarm id.
pub const ALARM_DETAIL: &str = "alarm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceType {
    Channel,
    Measure,
}

/// A reference from a measure to one of its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Upstream {
    pub path: String,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformType {
    CopyLatest,
    MinLatest,
    MaxLatest,
    SumLatest,
    AvgLatest,
    Javascript,
}

/// A derived series computed from channels and other measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub path: String,
    pub upstreams: Vec<Upstream>,
    pub transform_type: TransformType,
    pub data_type: DataType,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl Measure {
    pub fn new(path: &str, transform_type: TransformType, data_type: DataType) -> Self {
        Measure {
            path: path.to_string(),
            upstreams: Vec::new(),
            transform_type,
            data_type,
            details: BTreeMap::new(),
        }
    }

    pub fn with_channel(mut self, path: &str) -> Self {
        self.upstreams.push(Upstream {
            path: path.to_string(),
            source_type: SourceType::Channel,
        });
        self
    }

    pub fn with_measure(mut self, path: &str) -> Self {
        self.upstreams.push(Upstream {
            path: path.to_string(),
            source_type: SourceType::Measure,
        });
        self
    }

    pub fn with_script(mut self, script: &str) -> Self {
        self.details.insert(SCRIPT_DETAIL.to_string(), script.to_string());
        self
    }

    pub fn with_alarm(mut self, alarm_id: &str) -> Self {
        self.details.insert(ALARM_DETAIL.to_string(), alarm_id.to_string());
        self
    }

    pub fn script(&self) -> Option<&str> {
        self.details.get(SCRIPT_DETAIL).map(String::as_str)
    }

    pub fn alarm_id(&self) -> Option<&str> {
        self.details.get(ALARM_DETAIL).map(String::as_str)
    }
}

/// Most recent published sample per path, for channels and measures alike.
#[derive(Debug, Default)]
pub struct LatestValues {
    values: DashMap<String, Sample>,
}

impl LatestValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Sample> {
        self.values.get(path).map(|s| s.value().clone())
    }

    /// Records `sample` unless a newer one is already known for its path.
    pub fn publish(&self, sample: Sample) {
        self.values
            .entry(sample.path.clone())
            .and_modify(|current| {
                if sample.timestamp >= current.timestamp {
                    *current = sample.clone();
                }
            })
            .or_insert(sample);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_measure_details() {
        let m = Measure::new("m", TransformType::Javascript, DataType::Boolean)
            .with_channel("ch")
            .with_measure("other")
            .with_script("return true;")
            .with_alarm("ALM-1");
        assert_eq!(m.script(), Some("return true;"));
        assert_eq!(m.alarm_id(), Some("ALM-1"));
        assert_eq!(m.upstreams.len(), 2);
        assert_eq!(m.upstreams[1].source_type, SourceType::Measure);
    }

    #[test]
    fn test_measure_bincode_round_trip() {
        let m = Measure::new("avg", TransformType::AvgLatest, DataType::Double).with_channel("a");
        let bytes = bincode::serialize(&m).unwrap();
        let back: Measure = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_latest_values_keep_newest() {
        let latest = LatestValues::new();
        latest.publish(Sample::new("g", "p", 200, Value::Long(2)));
        latest.publish(Sample::new("g", "p", 100, Value::Long(1)));
        assert_eq!(latest.get("p").unwrap().value, Value::Long(2));
        latest.publish(Sample::new("g", "p", 300, Value::Long(3)));
        assert_eq!(latest.get("p").unwrap().value, Value::Long(3));
        assert_eq!(latest.len(), 1);
    }
}
