//! Request payloads are single JSON objects. [`Params`] keeps the decoded values as
//! [`serde_json::Value`] and converts lazily through typed accessors that report a
//! mismatch instead of failing unsafely.

use std::num::ParseIntError;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// String-keyed map of JSON values. Keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a payload that must be exactly one JSON object.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Alias of [`Params::get_string`].
    pub fn get(&self, key: &str) -> ParamResult<&str> {
        self.get_string(key)
    }

    /// Returns the string stored under `key`, or `""` when the key is absent.
    pub fn get_string(&self, key: &str) -> ParamResult<&str> {
        match self.0.get(key) {
            None => Ok(""),
            Some(Value::String(value)) => Ok(value),
            Some(other) => Err(ParamError::type_mismatch(key, "string", other)),
        }
    }

    /// Returns the value under `key` as a base-10 integer.
    ///
    /// Strings are parsed, JSON integers are taken as they are.
    ///
    /// # Errors
    ///
    /// [`ParamError::NotFound`] when absent, [`ParamError::InvalidInteger`] when a string
    /// does not parse, [`ParamError::TypeMismatch`] for any other value kind.
    pub fn get_int(&self, key: &str) -> ParamResult<i64> {
        match self.0.get(key) {
            None => Err(ParamError::NotFound {
                key: key.to_string(),
            }),
            Some(Value::String(value)) => {
                value
                    .parse::<i64>()
                    .map_err(|source| ParamError::InvalidInteger {
                        key: key.to_string(),
                        source,
                    })
            }
            Some(Value::Number(number)) => number
                .as_i64()
                .ok_or_else(|| ParamError::type_mismatch(key, "integer", &Value::Number(number.clone()))),
            Some(other) => Err(ParamError::type_mismatch(key, "integer", other)),
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Removes and returns `key` only when it holds an object; other values stay in place.
    pub fn take_object(&mut self, key: &str) -> Option<Params> {
        if !matches!(self.0.get(key), Some(Value::Object(_))) {
            return None;
        }
        match self.0.remove(key) {
            Some(Value::Object(object)) => Some(Params(object)),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Name of a JSON value kind, used in mismatch messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("key:{key} not found")]
    NotFound { key: String },

    #[error("key:{key} expected {expected}, got {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("key:{key} is not an integer: {source}")]
    InvalidInteger {
        key: String,
        #[source]
        source: ParseIntError,
    },
}

impl ParamError {
    fn type_mismatch(key: &str, expected: &'static str, found: &Value) -> Self {
        Self::TypeMismatch {
            key: key.to_string(),
            expected,
            found: value_kind(found),
        }
    }
}

pub type ParamResult<T> = Result<T, ParamError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_get_string() {
        let p = params(json!({"name": "world", "count": 3}));
        assert_eq!(p.get("name").unwrap(), "world");
        assert_eq!(p.get_string("missing").unwrap(), "");
        assert!(matches!(
            p.get_string("count"),
            Err(ParamError::TypeMismatch { expected: "string", found: "number", .. })
        ));
    }

    #[test]
    fn test_get_int() {
        let p = params(json!({"a": "123", "b": 42, "c": "abc", "d": 1.5, "e": true}));
        assert_eq!(p.get_int("a").unwrap(), 123);
        assert_eq!(p.get_int("b").unwrap(), 42);
        assert!(matches!(p.get_int("c"), Err(ParamError::InvalidInteger { .. })));
        assert!(matches!(p.get_int("d"), Err(ParamError::TypeMismatch { .. })));
        assert!(matches!(p.get_int("e"), Err(ParamError::TypeMismatch { .. })));
        let missing = p.get_int("missing").unwrap_err();
        assert_eq!(missing.to_string(), "key:missing not found");
    }

    #[test]
    fn test_take_object_only_removes_objects() {
        let mut p = params(json!({"HEADER": {"ua": "x"}, "COOKIE": "not-an-object"}));
        let header = p.take_object("HEADER").unwrap();
        assert_eq!(header.get("ua").unwrap(), "x");
        assert!(!p.contains_key("HEADER"));

        assert!(p.take_object("COOKIE").is_none());
        assert!(p.contains_key("COOKIE"));
    }

    #[test]
    fn test_decode_requires_object() {
        assert!(Params::decode(br#"{"a":1}"#).is_ok());
        assert!(Params::decode(br#"[1,2]"#).is_err());
        assert!(Params::decode(b"not json").is_err());
        assert!(Params::decode(b"null").is_err());
    }
}
