//! Response payloads understood by the drain.
//!
//! A response carries `{done, value}`. Reading either field may fail, so both are
//! exposed through [`DrainResponse`] as fallible accessors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{
    drain::{DrainError, DrainResult},
    event_bus::Value,
};

/// A payload that can answer a drain request.
#[cfg_attr(test, mockall::automock(type Item = String;))]
pub trait DrainResponse {
    type Item;

    /// Whether the sequence is exhausted.
    fn done(&self) -> DrainResult<bool>;

    /// The item carried by this response, if any.
    fn value(&self) -> DrainResult<Option<Self::Item>>;
}

/// One pulled step of a drained sequence.
///
/// `done == false` means `value` holds the next item. Once `done` is `true` the value
/// is not meaningful; synthetic terminal steps carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step<T> {
    pub done: bool,
    #[serde(default)]
    pub value: Option<T>,
}

impl<T> Step<T> {
    pub fn item(value: T) -> Self {
        Self {
            done: false,
            value: Some(value),
        }
    }

    pub fn terminal() -> Self {
        Self {
            done: true,
            value: None,
        }
    }
}

impl<T: Clone> DrainResponse for Step<T> {
    type Item = T;

    fn done(&self) -> DrainResult<bool> {
        Ok(self.done)
    }

    fn value(&self) -> DrainResult<Option<T>> {
        Ok(self.value.clone())
    }
}

impl Value {
    /// Builds a `{"done": .., "value": ..}` map.
    pub fn response(done: bool, value: Value) -> Self {
        let mut map = HashMap::new();
        map.insert("done".to_string(), Value::Boolean(done));
        map.insert("value".to_string(), value);
        Value::Map(map)
    }

    fn response_fields(&self) -> DrainResult<&HashMap<String, Value>> {
        match self {
            Value::Map(map) => Ok(map),
            other => Err(DrainError::Response {
                message: format!("response must be a map, got {:?}", other),
            }),
        }
    }
}

impl DrainResponse for Value {
    type Item = Value;

    fn done(&self) -> DrainResult<bool> {
        match self.response_fields()?.get("done") {
            Some(Value::Boolean(done)) => Ok(*done),
            Some(other) => Err(DrainError::Response {
                message: format!("`done` must be a boolean, got {:?}", other),
            }),
            None => Err(DrainError::Response {
                message: "`done` is missing".to_string(),
            }),
        }
    }

    /// An absent `value` key reads as `None`; an explicit `Null` is a regular item.
    fn value(&self) -> DrainResult<Option<Value>> {
        Ok(self.response_fields()?.get("value").cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_response() {
        let response = Value::response(false, Value::from("a"));
        assert!(!response.done().unwrap());
        assert_eq!(response.value().unwrap(), Some(Value::from("a")));

        let terminal = Value::response(true, Value::Null);
        assert!(terminal.done().unwrap());
        assert_eq!(terminal.value().unwrap(), Some(Value::Null));
    }

    #[test]
    fn test_value_response_null_item() {
        let response = Value::from_json(serde_json::json!({"done": false, "value": null}));
        assert!(!response.done().unwrap());
        assert_eq!(response.value().unwrap(), Some(Value::Null));

        let without_value = Value::from_json(serde_json::json!({"done": true}));
        assert_eq!(without_value.value().unwrap(), None);
    }

    #[test]
    fn test_value_response_shape_errors() {
        assert!(matches!(
            Value::from("not a map").done(),
            Err(DrainError::Response { .. })
        ));

        let mut map = HashMap::new();
        map.insert("done".to_string(), Value::Integer(1));
        assert!(matches!(
            Value::Map(map).done(),
            Err(DrainError::Response { .. })
        ));

        assert!(matches!(
            Value::Map(HashMap::new()).done(),
            Err(DrainError::Response { message }) if message.contains("missing")
        ));
    }

    #[test]
    fn test_value_response_from_json_wire() {
        let response = Value::from_json(serde_json::json!({"done": false, "value": 42}));
        assert!(!response.done().unwrap());
        assert_eq!(response.value().unwrap(), Some(Value::Integer(42)));
    }

    #[test]
    fn test_step_serde() {
        let step: Step<String> = serde_json::from_str(r#"{"done": true}"#).unwrap();
        assert_eq!(step, Step::terminal());

        let json = serde_json::to_string(&Step::item("a".to_string())).unwrap();
        assert_eq!(json, r#"{"done":false,"value":"a"}"#);
    }
}
