//! Per-visual metadata.
//!
//! Sensors read open-ended annotations off visuals: `"label"` for the
//! segmentation and bounding-box cameras, `"temperature"` for the thermal
//! camera, `"laser_retro"` for the lidar. The value type is fixed at
//! assignment time; there is no runtime type probing.

use std::collections::HashMap;

/// Metadata keys the built-in sensors recognise.
pub mod keys {
    /// Class label, segmentation and bounding-box cameras.
    pub const LABEL: &str = "label";
    /// Surface temperature in kelvin, thermal camera.
    pub const TEMPERATURE: &str = "temperature";
    /// Retro-reflectivity, lidar intensity channel.
    pub const LASER_RETRO: &str = "laser_retro";
}

/// A metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer.
    Int(i64),
    /// Single-precision float.
    Float(f32),
    /// Double-precision float.
    Double(f64),
    /// String.
    Str(String),
}

impl Value {
    /// Numeric view as `f64`; `None` for strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    /// Numeric view as `f32`; `None` for strings.
    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|v| v as f32)
    }

    /// Integer view; floats are truncated, `None` for strings.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Double(v) => Some(*v as i64),
            Value::Str(_) => None,
        }
    }

    /// String view; `None` for numeric values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

/// Key-value metadata attached to a visual.
pub type MetadataMap = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Int(7).as_f64(), Some(7.0));
        assert_eq!(Value::Float(1.5).as_i64(), Some(1));
        assert_eq!(Value::Double(2.25).as_f32(), Some(2.25));
        assert_eq!(Value::Str("box".into()).as_f64(), None);
        assert_eq!(Value::Str("box".into()).as_str(), Some("box"));
    }
}
