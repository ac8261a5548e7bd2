//! Columnar value and buffer primitives.
//!
//! `Value` is the tagged scalar exchanged between the storage engine, the
//! executors and the SQL layer. `Column` stores a homogeneous sequence of
//! values contiguously, one buffer per supported type.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Data types supported by the columnar store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Int,
    String,
    Float,
    Bool,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "INT",
            DataType::String => "STRING",
            DataType::Float => "FLOAT",
            DataType::Bool => "BOOL",
        };
        f.write_str(name)
    }
}

/// A typed scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    String(String),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::String(_) => DataType::String,
            Value::Float(_) => DataType::Float,
            Value::Bool(_) => DataType::Bool,
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(EngineError::Execution(format!(
                "value is not an int, got {}",
                other.data_type()
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(v) => Ok(v),
            other => Err(EngineError::Execution(format!(
                "value is not a string, got {}",
                other.data_type()
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(EngineError::Execution(format!(
                "value is not a float, got {}",
                other.data_type()
            ))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(EngineError::Execution(format!(
                "value is not a bool, got {}",
                other.data_type()
            ))),
        }
    }
}

/// The canonical textual form. Join and aggregation keys rely on this being
/// deterministic and locale independent.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Compares two values, widening INT to FLOAT when the types are mixed.
/// Any other cross-type comparison is an execution error.
pub fn compare_values(left: &Value, right: &Value) -> Result<Ordering> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => Ok(l.cmp(r)),
        (Value::Float(l), Value::Float(r)) => Ok(compare_floats(*l, *r)),
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Ok(l.cmp(r)),
        (Value::Int(l), Value::Float(r)) => Ok(compare_floats(*l as f64, *r)),
        (Value::Float(l), Value::Int(r)) => Ok(compare_floats(*l, *r as f64)),
        (l, r) => Err(EngineError::Execution(format!(
            "incompatible types in comparison ({} vs {})",
            l.data_type(),
            r.data_type()
        ))),
    }
}

fn compare_floats(left: f64, right: f64) -> Ordering {
    if left < right {
        Ordering::Less
    } else if left > right {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// A named column of homogeneous data.
///
/// All four buffers exist but exactly one is populated, selected by
/// `data_type`; its length is the column length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub int_data: Vec<i64>,
    pub string_data: Vec<String>,
    pub float_data: Vec<f64>,
    pub bool_data: Vec<bool>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Column {
            name: name.into(),
            data_type,
            int_data: Vec::new(),
            string_data: Vec::new(),
            float_data: Vec::new(),
            bool_data: Vec::new(),
        }
    }

    /// Appends a value, rejecting type mismatches.
    pub fn append(&mut self, value: Value) -> Result<()> {
        if value.data_type() != self.data_type {
            return Err(EngineError::Schema(format!(
                "type mismatch: column {} is {}, got {}",
                self.name,
                self.data_type,
                value.data_type()
            )));
        }
        match value {
            Value::Int(v) => self.int_data.push(v),
            Value::String(v) => self.string_data.push(v),
            Value::Float(v) => self.float_data.push(v),
            Value::Bool(v) => self.bool_data.push(v),
        }
        Ok(())
    }

    /// Returns the value at `index`, bounds checked.
    pub fn get(&self, index: usize) -> Result<Value> {
        if index >= self.len() {
            return Err(EngineError::Execution(format!(
                "index out of bounds: {} (len: {})",
                index,
                self.len()
            )));
        }
        let value = match self.data_type {
            DataType::Int => Value::Int(self.int_data[index]),
            DataType::String => Value::String(self.string_data[index].clone()),
            DataType::Float => Value::Float(self.float_data[index]),
            DataType::Bool => Value::Bool(self.bool_data[index]),
        };
        Ok(value)
    }

    pub fn len(&self) -> usize {
        match self.data_type {
            DataType::Int => self.int_data.len(),
            DataType::String => self.string_data.len(),
            DataType::Float => self.float_data.len(),
            DataType::Bool => self.bool_data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an independent column holding `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> Result<Column> {
        if end > self.len() || start > end {
            return Err(EngineError::Execution(format!(
                "invalid slice range [{start}:{end}] for length {}",
                self.len()
            )));
        }
        let mut out = Column::new(self.name.clone(), self.data_type);
        match self.data_type {
            DataType::Int => out.int_data = self.int_data[start..end].to_vec(),
            DataType::String => out.string_data = self.string_data[start..end].to_vec(),
            DataType::Float => out.float_data = self.float_data[start..end].to_vec(),
            DataType::Bool => out.bool_data = self.bool_data[start..end].to_vec(),
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_get_roundtrips() {
        let mut col = Column::new("user_id", DataType::Int);
        col.append(Value::Int(42)).unwrap();
        col.append(Value::Int(7)).unwrap();
        assert_eq!(col.len(), 2);
        assert_eq!(col.get(0).unwrap(), Value::Int(42));
        assert_eq!(col.get(1).unwrap(), Value::Int(7));
    }

    #[test]
    fn append_rejects_type_mismatch() {
        let mut col = Column::new("country", DataType::String);
        let err = col.append(Value::Int(1)).unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
    }

    #[test]
    fn get_is_bounds_checked() {
        let col = Column::new("value", DataType::Float);
        assert!(col.get(0).is_err());
    }

    #[test]
    fn slice_is_independent() {
        let mut col = Column::new("v", DataType::Int);
        for i in 0..5 {
            col.append(Value::Int(i)).unwrap();
        }
        let mut sub = col.slice(1, 3).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.get(0).unwrap(), Value::Int(1));
        sub.append(Value::Int(99)).unwrap();
        assert_eq!(col.len(), 5);
    }

    #[test]
    fn cross_type_comparison_widens_int() {
        assert_eq!(
            compare_values(&Value::Int(2), &Value::Float(2.5)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Float(3.0), &Value::Int(3)).unwrap(),
            Ordering::Equal
        );
        assert!(compare_values(&Value::Int(1), &Value::String("a".into())).is_err());
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(10.5).to_string(), "10.5");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::String("BR".into()).to_string(), "BR");
    }
}
