//! Attribute values exchanged between simulators.

use serde::de::Deserializer;
use serde::ser::{Error as _, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value flowing along a connection.
///
/// Between two in-process simulators any payload may be exchanged, so
/// values are either plain JSON or an opaque shared object. Opaque
/// values cannot cross a process boundary: serializing one fails, and
/// the transport layer reports every offending source for a destination
/// at once instead of dying on the first.
#[derive(Clone)]
pub enum SimValue {
    /// A JSON-serializable value. Everything a remote simulator sends
    /// or receives is of this shape.
    Json(Value),
    /// An arbitrary shared object, only meaningful to in-process
    /// simulators that know its concrete type.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl SimValue {
    /// Convenience constructor from anything JSON-like.
    pub fn json(value: impl Into<Value>) -> Self {
        SimValue::Json(value.into())
    }

    /// Wrap an arbitrary object for in-process exchange.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        SimValue::Opaque(Arc::new(value))
    }

    /// The JSON payload, if this value has one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            SimValue::Json(v) => Some(v),
            SimValue::Opaque(_) => None,
        }
    }

    /// Downcast an opaque value to its concrete type.
    pub fn downcast<T: Any>(&self) -> Option<&T> {
        match self {
            SimValue::Opaque(v) => v.downcast_ref(),
            SimValue::Json(_) => None,
        }
    }
}

impl fmt::Debug for SimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimValue::Json(v) => write!(f, "Json({v})"),
            SimValue::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl PartialEq for SimValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SimValue::Json(a), SimValue::Json(b)) => a == b,
            (SimValue::Opaque(a), SimValue::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Value> for SimValue {
    fn from(value: Value) -> Self {
        SimValue::Json(value)
    }
}

impl Serialize for SimValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SimValue::Json(v) => v.serialize(serializer),
            SimValue::Opaque(_) => Err(S::Error::custom("opaque value is not JSON-serializable")),
        }
    }
}

impl<'de> Deserialize<'de> for SimValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(SimValue::Json(Value::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_values_roundtrip() {
        let v = SimValue::json(json!({"p": 1.5}));
        let s = serde_json::to_string(&v).unwrap();
        let back: SimValue = serde_json::from_str(&s).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn opaque_values_refuse_serialization() {
        let v = SimValue::opaque(|x: u32| x + 1);
        assert!(serde_json::to_string(&v).is_err());
        assert!(v.downcast::<fn(u32) -> u32>().is_none());
    }

    #[test]
    fn opaque_downcast() {
        let v = SimValue::opaque(vec![1u8, 2, 3]);
        assert_eq!(v.downcast::<Vec<u8>>().unwrap(), &vec![1u8, 2, 3]);
    }
}
