//! Scalar values, samples and time keys shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw packet as produced by the device: field label to raw text.
pub type RawPacket = BTreeMap<String, String>;

/// Field name to scalar value.
pub type Fields = BTreeMap<String, Value>;

/// Node name to the list of fields requested from it.
pub type Structure = BTreeMap<String, Vec<String>>;

/// Integer seconds used as the cache bucket key.
pub type TimeKey = i64;

/// Acquisition time field of a stored entry.
pub const TIME_FIELD: &str = "time";

/// Sub-second time field of a stored entry.
pub const TIME_REF_FIELD: &str = "time_ref";

/// Metadata fields stored alongside the measured ones.
pub const TIME_FIELDS: [&str; 2] = [TIME_FIELD, TIME_REF_FIELD];

/// One measurement value.
///
/// Serialized untagged so cache entries stay plain JSON objects
/// (`{"V": 12.3, "CS": 3, "PID": "0xA053"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer value
    Int(i64),
    /// Real value
    Float(f64),
    /// Text value (only ever seen before normalization)
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

/// A normalized reading with its acquisition time.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Wall-clock acquisition time in seconds
    pub time: f64,
    /// Sub-second part of `time`, rounded to milliseconds
    pub time_ref: f64,
    /// Measured fields
    pub fields: Fields,
}

impl Sample {
    /// Build a sample stamped at `time`.
    pub fn new(time: f64, fields: Fields) -> Self {
        Self {
            time,
            time_ref: time_ref(time),
            fields,
        }
    }

    /// Cache bucket of this sample.
    pub fn time_key(&self) -> TimeKey {
        self.time.floor() as TimeKey
    }

    /// Fields as stored in the cache, with `time` and `time_ref` added.
    pub fn into_entry(self) -> Fields {
        let mut fields = self.fields;
        fields.insert(TIME_FIELD.to_string(), Value::Float(self.time));
        fields.insert(TIME_REF_FIELD.to_string(), Value::Float(self.time_ref));
        fields
    }
}

/// Current wall-clock time in seconds.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Sub-second fraction of `time`, rounded to milliseconds.
pub fn time_ref(time: f64) -> f64 {
    ((time - time.floor()) * 1000.0).round() / 1000.0
}

/// Round to three decimal digits.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_time_metadata() {
        let sample = Sample::new(1_722_013_441.2346, Fields::new());
        assert_eq!(sample.time_key(), 1_722_013_441);
        assert!((sample.time_ref - 0.235).abs() < 1e-9);
    }

    #[test]
    fn entry_carries_time_metadata() {
        let mut fields = Fields::new();
        fields.insert("V".into(), Value::Float(12.8));
        let entry = Sample::new(1_722_013_441.5, fields).into_entry();
        assert_eq!(entry[TIME_FIELD], Value::Float(1_722_013_441.5));
        assert_eq!(entry[TIME_REF_FIELD], Value::Float(0.5));
        assert_eq!(entry["V"], Value::Float(12.8));
    }

    #[test]
    fn entry_json_round_trip() {
        let mut fields = Fields::new();
        fields.insert("V".into(), Value::Float(12.345));
        fields.insert("CS".into(), Value::Int(3));
        fields.insert("PID".into(), Value::Str("0xA053".into()));

        let json = serde_json::to_string(&fields).unwrap();
        let decoded: Fields = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, fields);
    }
}
