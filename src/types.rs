use crate::error::PulseError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Reconstructed read result: group code -> path -> timestamp -> value.
pub type Matrix = BTreeMap<String, BTreeMap<String, BTreeMap<Timestamp, Value>>>;

/// Declared data type of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Double,
    Long,
    Boolean,
    String,
}

impl DataType {
    /// The value published when a computation for this type cannot produce one.
    pub fn zero_value(self) -> Value {
        match self {
            DataType::Double => Value::Double(0.0),
            DataType::Long => Value::Long(0),
            DataType::Boolean => Value::Boolean(false),
            DataType::String => Value::Text(String::new()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Double => "DOUBLE",
            DataType::Long => "LONG",
            DataType::Boolean => "BOOLEAN",
            DataType::String => "STRING",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Double | DataType::Long)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed scalar. The variant is the runtime type, so a value can never disagree with
/// the type it reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Double(f64),
    Long(i64),
    Boolean(bool),
    Text(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Double(_) => DataType::Double,
            Value::Long(_) => DataType::Long,
            Value::Boolean(_) => DataType::Boolean,
            Value::Text(_) => DataType::String,
        }
    }

    /// Numeric view. Booleans map to 1/0, strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Long(v) => Some(*v as f64),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Long(v) => Some(*v != 0),
            Value::Double(v) if v.is_nan() => None,
            Value::Double(v) => Some(*v != 0.0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Value::Double(v) => v.to_string(),
            Value::Long(v) => v.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    /// Converts the value into `target`, failing when no sensible conversion exists.
    pub fn coerce(self, target: DataType) -> Result<Value, PulseError> {
        if self.data_type() == target {
            return Ok(self);
        }
        let from = self.data_type();
        let converted = match target {
            DataType::Double => self.as_f64().map(Value::Double),
            DataType::Long => self
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| Value::Long(v.trunc() as i64)),
            DataType::Boolean => self.as_bool().map(Value::Boolean),
            DataType::String => Some(Value::Text(self.as_text())),
        };
        converted.ok_or_else(|| {
            PulseError::UnsupportedOperation(format!("cannot coerce {} value to {}", from, target))
        })
    }

    /// Natural ordering: numbers numerically (LONG and DOUBLE mix), `false < true`,
    /// strings lexicographically. Any other pairing is not comparable.
    pub fn compare(&self, other: &Value) -> Result<Ordering, PulseError> {
        match (self, other) {
            (Value::Long(a), Value::Long(b)) => Ok(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
            (a, b) if a.data_type().is_numeric() && b.data_type().is_numeric() => {
                let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                Ok(x.total_cmp(&y))
            }
            (a, b) => Err(PulseError::UnsupportedOperation(format!(
                "cannot compare {} with {}",
                a.data_type(),
                b.data_type()
            ))),
        }
    }

    /// Smallest value; the first one wins on ties.
    pub fn min_of<'a, I>(values: I) -> Result<Option<&'a Value>, PulseError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        Self::extreme(values, Ordering::Less)
    }

    /// Largest value; the first one wins on ties.
    pub fn max_of<'a, I>(values: I) -> Result<Option<&'a Value>, PulseError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        Self::extreme(values, Ordering::Greater)
    }

    fn extreme<'a, I>(values: I, wanted: Ordering) -> Result<Option<&'a Value>, PulseError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut best: Option<&Value> = None;
        for v in values {
            best = match best {
                None => Some(v),
                Some(b) if v.compare(b)? == wanted => Some(v),
                keep => keep,
            };
        }
        Ok(best)
    }

    /// Sum of numeric values. All LONG sums to LONG, anything involving DOUBLE sums to DOUBLE.
    /// An all-LONG sum that leaves the `i64` range is an error rather than a clamped value.
    pub fn sum_of<'a, I>(values: I) -> Result<Option<Value>, PulseError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut seen = false;
        let mut all_long = true;
        let mut long_acc: Option<i64> = Some(0);
        let mut double_acc: f64 = 0.0;
        for v in values {
            seen = true;
            match v {
                Value::Long(x) => {
                    long_acc = long_acc.and_then(|acc| acc.checked_add(*x));
                    double_acc += *x as f64;
                }
                Value::Double(x) => {
                    all_long = false;
                    double_acc += *x;
                }
                other => {
                    return Err(PulseError::UnsupportedOperation(format!(
                        "SUM is not defined for {} values",
                        other.data_type()
                    )))
                }
            }
        }
        if !seen {
            return Ok(None);
        }
        if !all_long {
            return Ok(Some(Value::Double(double_acc)));
        }
        match long_acc {
            Some(total) => Ok(Some(Value::Long(total))),
            None => Err(PulseError::UnsupportedOperation(
                "LONG SUM overflows i64".to_string(),
            )),
        }
    }

    /// Arithmetic mean of numeric values, always DOUBLE.
    pub fn mean_of<'a, I>(values: I) -> Result<Option<Value>, PulseError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut count = 0usize;
        let mut total = 0.0f64;
        for v in values {
            match v {
                Value::Long(x) => total += *x as f64,
                Value::Double(x) => total += *x,
                other => {
                    return Err(PulseError::UnsupportedOperation(format!(
                        "AVG is not defined for {} values",
                        other.data_type()
                    )))
                }
            }
            count += 1;
        }
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(Value::Double(total / count as f64)))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// A single timestamped value produced by a connector, an accumulator or a measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub group_code: String,
    pub path: String,
    pub timestamp: Timestamp,
    pub value: Value,
    /// Lineage tag of the ingest batch the point came from.
    pub batch_id: Option<String>,
}

impl Sample {
    pub fn new(group_code: &str, path: &str, timestamp: Timestamp, value: Value) -> Self {
        Sample {
            group_code: group_code.to_string(),
            path: path.to_string(),
            timestamp,
            value,
            batch_id: None,
        }
    }

    pub fn with_batch_id(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

/// Registration record of one stored series. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub id: String,
    pub group_code: String,
    pub path: String,
    pub safe_path: String,
    pub data_type: DataType,
    pub sampling_rate: i64,
    /// Backing collection holding this series' chunks.
    pub collection: String,
}

/// Columnar storage unit holding one series' points for `[ts_start, ts_end)`.
///
/// `timestamps`, `values` and `batch_ids` are index aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub safe_path: String,
    pub data_type: DataType,
    pub sampling_rate: i64,
    pub ts_start: Timestamp,
    pub ts_end: Timestamp,
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<Value>,
    pub batch_ids: Vec<Option<String>>,
}

impl Chunk {
    /// Returns the number of data points in the chunk.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}
