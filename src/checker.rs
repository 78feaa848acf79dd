//! Typed validation and rescaling of device fields.
//!
//! Every point read from a device is described by a [`FieldDescriptor`]: the type
//! the raw text must parse as, the numeric type it is delivered as, and an optional
//! scale factor (`floatpoint`). [`check`] applies one descriptor, [`check_all`]
//! applies a whole schema to a sample.
//!
//! # Example
//!
//! ```
//! use solar_monitor::checker::{check, FieldDescriptor, NumericType, Scale};
//! use solar_monitor::sample::Value;
//!
//! let desc = FieldDescriptor::Int { output: NumericType::Float, scale: Scale::new(0.001) };
//! let volts = check("V", &Value::from("5526"), &desc).unwrap();
//! assert_eq!(volts, Value::Float(5.526));
//! ```

use crate::error::{AppResult, MonitorError};
use crate::sample::{round3, Fields, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Numeric type a field is delivered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericType {
    /// Integer
    Int,
    /// Real
    Float,
}

impl fmt::Display for NumericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericType::Int => f.write_str("int"),
            NumericType::Float => f.write_str("float"),
        }
    }
}

/// Non-negative scale factor. Zero means "no scaling".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Scale(f64);

impl Scale {
    /// No scaling.
    pub const NONE: Scale = Scale(0.0);

    /// Wrap a factor. Use [`Scale::parse`] for untrusted input.
    pub fn new(factor: f64) -> Self {
        Self(factor)
    }

    /// Validate a factor read from configuration.
    pub fn parse(field: &str, factor: f64) -> AppResult<Self> {
        if !factor.is_finite() || factor < 0.0 {
            return Err(MonitorError::DeviceDataConf {
                field: field.to_string(),
                reason: format!("floatpoint must be a non-negative number, got {factor}"),
            });
        }
        Ok(Self(factor))
    }

    /// The raw factor.
    pub fn factor(&self) -> f64 {
        self.0
    }

    /// Whether the factor changes values.
    pub fn is_active(&self) -> bool {
        self.0 != 0.0
    }
}

/// Typed schema entry for one field, tagged by input type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDescriptor {
    /// Raw text is an integer
    Int {
        /// Delivered type
        output: NumericType,
        /// Scale applied after widening
        scale: Scale,
    },
    /// Raw text is a real number
    Float {
        /// Delivered type
        output: NumericType,
        /// Scale applied after widening
        scale: Scale,
    },
    /// Raw text is free text; no numeric output can be produced from it
    Str {
        /// Delivered type
        output: NumericType,
    },
}

impl FieldDescriptor {
    /// Type the value is delivered as.
    pub fn output_type(&self) -> NumericType {
        match self {
            FieldDescriptor::Int { output, .. }
            | FieldDescriptor::Float { output, .. }
            | FieldDescriptor::Str { output } => *output,
        }
    }

    /// Scale factor applied after widening.
    pub fn scale(&self) -> Scale {
        match self {
            FieldDescriptor::Int { scale, .. } | FieldDescriptor::Float { scale, .. } => *scale,
            FieldDescriptor::Str { .. } => Scale::NONE,
        }
    }

    fn input_name(&self) -> &'static str {
        match self {
            FieldDescriptor::Int { .. } => "int",
            FieldDescriptor::Float { .. } => "float",
            FieldDescriptor::Str { .. } => "string",
        }
    }
}

/// Descriptor as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    /// `int`, `float` or `string`
    #[serde(default)]
    pub input_type: Option<String>,
    /// `int` or `float`
    #[serde(default)]
    pub output_type: Option<String>,
    /// Scale factor, 0 or absent for none
    #[serde(default)]
    pub floatpoint: Option<f64>,
}

impl PointConfig {
    /// Turn the loose configuration form into a typed descriptor.
    pub fn to_descriptor(&self, field: &str) -> AppResult<FieldDescriptor> {
        let conf_err = |reason: String| MonitorError::DeviceDataConf {
            field: field.to_string(),
            reason,
        };

        let input = self
            .input_type
            .as_deref()
            .ok_or_else(|| conf_err("missing input_type".into()))?;
        let output = match self.output_type.as_deref() {
            Some("int") => NumericType::Int,
            Some("float") => NumericType::Float,
            Some(other) => return Err(conf_err(format!("unknown output_type '{other}'"))),
            None => return Err(conf_err("missing output_type".into())),
        };
        let scale = Scale::parse(field, self.floatpoint.unwrap_or(0.0))?;

        match input {
            "int" => Ok(FieldDescriptor::Int { output, scale }),
            "float" => Ok(FieldDescriptor::Float { output, scale }),
            "string" | "str" => Ok(FieldDescriptor::Str { output }),
            other => Err(conf_err(format!("unknown input_type '{other}'"))),
        }
    }
}

/// Field name to typed descriptor.
pub type Schema = BTreeMap<String, FieldDescriptor>;

/// Build a typed schema from the configuration's point table.
pub fn build_schema(points: &BTreeMap<String, PointConfig>) -> AppResult<Schema> {
    points
        .iter()
        .map(|(name, conf)| Ok((name.clone(), conf.to_descriptor(name)?)))
        .collect()
}

/// Validate and convert one field.
pub fn check(field: &str, raw: &Value, descriptor: &FieldDescriptor) -> AppResult<Value> {
    let input = coerce_input(field, raw, descriptor)?;
    let widened = widen(field, input, descriptor.output_type())?;
    apply_scale(field, widened, descriptor.scale())
}

/// Validate and convert every field of `fields`.
///
/// Descriptors from `overrides` win over `schema`. Fields without any descriptor
/// are dropped: they are device metadata (`PID`, `Checksum`, ...) with no numeric
/// meaning downstream.
pub fn check_all(fields: &Fields, schema: &Schema, overrides: &Schema) -> AppResult<Fields> {
    let mut checked = Fields::new();
    for (name, raw) in fields {
        let Some(descriptor) = overrides.get(name).or_else(|| schema.get(name)) else {
            tracing::trace!(field = %name, "no descriptor, dropping field");
            continue;
        };
        checked.insert(name.clone(), check(name, raw, descriptor)?);
    }
    Ok(checked)
}

enum Input {
    Int(i64),
    Float(f64),
    Str(String),
}

fn coerce_input(field: &str, raw: &Value, descriptor: &FieldDescriptor) -> AppResult<Input> {
    let input_err = || MonitorError::InputValue {
        field: field.to_string(),
        value: raw.to_string(),
        expected: descriptor.input_name().to_string(),
    };

    match descriptor {
        FieldDescriptor::Int { .. } => match raw {
            Value::Int(v) => Ok(Input::Int(*v)),
            Value::Float(v) => exact_int(*v).map(Input::Int).ok_or_else(input_err),
            Value::Str(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<i64>() {
                    return Ok(Input::Int(v));
                }
                s.parse::<f64>()
                    .ok()
                    .and_then(exact_int)
                    .map(Input::Int)
                    .ok_or_else(input_err)
            }
        },
        FieldDescriptor::Float { .. } => match raw {
            Value::Int(v) => Ok(Input::Float(*v as f64)),
            Value::Float(v) => Ok(Input::Float(*v)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Input::Float)
                .ok_or_else(input_err),
        },
        FieldDescriptor::Str { .. } => Ok(Input::Str(raw.to_string())),
    }
}

fn widen(field: &str, input: Input, output: NumericType) -> AppResult<Value> {
    let output_err = |value: String| MonitorError::OutputValue {
        field: field.to_string(),
        value,
        expected: output.to_string(),
    };

    match (input, output) {
        (Input::Int(v), NumericType::Int) => Ok(Value::Int(v)),
        (Input::Int(v), NumericType::Float) => Ok(Value::Float(v as f64)),
        (Input::Float(v), NumericType::Float) => Ok(Value::Float(v)),
        (Input::Float(v), NumericType::Int) => exact_int(v)
            .map(Value::Int)
            .ok_or_else(|| output_err(v.to_string())),
        (Input::Str(s), _) => Err(output_err(s)),
    }
}

fn apply_scale(field: &str, value: Value, scale: Scale) -> AppResult<Value> {
    if !scale.is_active() {
        return Ok(value);
    }
    match value {
        Value::Float(v) => Ok(Value::Float(round3(v * scale.factor()))),
        Value::Int(v) => {
            let scaled = round3(v as f64 * scale.factor());
            exact_int(scaled)
                .map(Value::Int)
                .ok_or_else(|| MonitorError::OutputValue {
                    field: field.to_string(),
                    value: scaled.to_string(),
                    expected: NumericType::Int.to_string(),
                })
        }
        Value::Str(s) => Err(MonitorError::OutputValue {
            field: field.to_string(),
            value: s,
            expected: "number".into(),
        }),
    }
}

fn exact_int(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}
