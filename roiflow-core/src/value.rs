//! Slot values and slot metadata.

use crate::array::{ArrayData, DType};
use crate::roi::Roi;
use crate::{Error, Result};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Metadata describing what a slot produces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Meta {
    /// Extent per axis. Empty for whole-value slots.
    pub shape: Vec<usize>,
    /// Element type of array slots.
    pub dtype: Option<DType>,
    /// One character per axis, e.g. `"zyx"`.
    pub axistags: Option<String>,
    /// Physical units of the values.
    pub units: Option<String>,
}

impl Meta {
    /// Metadata of an array slot.
    #[must_use]
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype: Some(dtype),
            axistags: None,
            units: None,
        }
    }

    /// Metadata of a whole-value slot.
    #[must_use]
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Metadata matching a concrete value.
    #[must_use]
    pub fn for_value(value: &Value) -> Self {
        match value {
            Value::Array(array) => Self::new(array.shape().to_vec(), array.dtype()),
            _ => Self::scalar(),
        }
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    #[must_use]
    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }

    #[must_use]
    pub fn with_axistags(mut self, axistags: impl Into<String>) -> Self {
        self.axistags = Some(axistags.into());
        self
    }

    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Element type, required for array slots.
    ///
    /// # Errors
    /// Returns [`Error::Config`] when no dtype has been assigned.
    pub fn require_dtype(&self) -> Result<DType> {
        self.dtype
            .ok_or_else(|| Error::Config(format!("metadata {:?} carries no dtype", self.shape)))
    }
}

/// A value carried by a slot.
#[derive(Clone, Default)]
pub enum Value {
    /// No value (e.g. an untrained classifier).
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// A list of regions.
    Rois(Vec<Roi>),
    Array(ArrayData),
    /// An object the engine treats as opaque (e.g. a classifier).
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wraps an arbitrary object.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Rois(_) => "rois",
            Value::Array(_) => "array",
            Value::Opaque(_) => "opaque",
        }
    }

    fn mismatch(&self, expected: &str) -> Error {
        Error::DTypeMismatch {
            expected: expected.to_string(),
            found: self.kind().to_string(),
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for non-bool values.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(other.mismatch("bool")),
        }
    }

    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for non-integer values.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(other.mismatch("int")),
        }
    }

    /// Numeric value; integers are widened.
    ///
    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for non-numeric values.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(other.mismatch("float")),
        }
    }

    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for non-text values.
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Value::Text(v) => Ok(v),
            other => Err(other.mismatch("text")),
        }
    }

    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for values that are not region lists.
    pub fn as_rois(&self) -> Result<&[Roi]> {
        match self {
            Value::Rois(v) => Ok(v),
            other => Err(other.mismatch("rois")),
        }
    }

    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for non-array values.
    pub fn as_array(&self) -> Result<&ArrayData> {
        match self {
            Value::Array(v) => Ok(v),
            other => Err(other.mismatch("array")),
        }
    }

    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for non-array values.
    pub fn as_array_mut(&mut self) -> Result<&mut ArrayData> {
        match self {
            Value::Array(v) => Ok(v),
            other => Err(other.mismatch("array")),
        }
    }

    /// # Errors
    /// Returns [`Error::DTypeMismatch`] for non-array values.
    pub fn into_array(self) -> Result<ArrayData> {
        match self {
            Value::Array(v) => Ok(v),
            other => Err(other.mismatch("array")),
        }
    }

    /// The wrapped object if this is an opaque value of type `T`.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Opaque(any) => Arc::clone(any).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Text(v) => write!(f, "Text({v:?})"),
            Value::Rois(v) => write!(f, "Rois({} regions)", v.len()),
            Value::Array(a) => write!(f, "Array({}, {:?})", a.dtype(), a.shape()),
            Value::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Rois(a), Value::Rois(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<Roi>> for Value {
    fn from(v: Vec<Roi>) -> Self {
        Value::Rois(v)
    }
}

impl From<ArrayData> for Value {
    fn from(v: ArrayData) -> Self {
        Value::Array(v)
    }
}
