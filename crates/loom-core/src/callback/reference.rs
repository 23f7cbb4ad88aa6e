//! CallbackRef: how a hook is referred to before it is resolved.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::{CallbackError, TaskError};

/// A resolved hook: `(result, error)`.
///
/// Success hooks get `(Some(result), None)`, failure hooks `(None, Some(err))`.
pub type Callback = Arc<dyn Fn(Option<&Value>, Option<&TaskError>) + Send + Sync>;

/// Reference to a hook, resolved lazily by `CallbackRegistry::resolve`.
#[derive(Clone, Default)]
pub enum CallbackRef {
    #[default]
    Absent,
    Direct(Callback),
    /// Registry name, or `module.path.attr` for the module loader.
    Named(String),
}

impl CallbackRef {
    pub fn direct<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&TaskError>) + Send + Sync + 'static,
    {
        CallbackRef::Direct(Arc::new(f))
    }

    pub fn named(name: impl Into<String>) -> Self {
        CallbackRef::Named(name.into())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, CallbackRef::Absent)
    }

    /// Human readable form for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            CallbackRef::Absent => "<absent>".to_string(),
            CallbackRef::Direct(_) => "<direct>".to_string(),
            CallbackRef::Named(name) => name.clone(),
        }
    }
}

impl fmt::Debug for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackRef::Absent => f.write_str("Absent"),
            CallbackRef::Direct(_) => f.write_str("Direct(..)"),
            CallbackRef::Named(name) => f.debug_tuple("Named").field(name).finish(),
        }
    }
}

impl From<&str> for CallbackRef {
    fn from(name: &str) -> Self {
        CallbackRef::Named(name.to_string())
    }
}

impl From<String> for CallbackRef {
    fn from(name: String) -> Self {
        CallbackRef::Named(name)
    }
}

impl From<Callback> for CallbackRef {
    fn from(callback: Callback) -> Self {
        CallbackRef::Direct(callback)
    }
}

impl<T: Into<CallbackRef>> From<Option<T>> for CallbackRef {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// Hooks arriving from configuration are plain JSON: `null` or a string.
impl TryFrom<&Value> for CallbackRef {
    type Error = CallbackError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(CallbackRef::Absent),
            Value::String(name) => Ok(CallbackRef::Named(name.clone())),
            Value::Bool(_) => Err(CallbackError::InvalidCallbackType("bool".into())),
            Value::Number(_) => Err(CallbackError::InvalidCallbackType("number".into())),
            Value::Array(_) => Err(CallbackError::InvalidCallbackType("array".into())),
            Value::Object(_) => Err(CallbackError::InvalidCallbackType("object".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn json_null_and_string_convert() {
        assert!(CallbackRef::try_from(&Value::Null).unwrap().is_absent());
        let named = CallbackRef::try_from(&json!("hooks.notify")).unwrap();
        assert!(matches!(named, CallbackRef::Named(ref n) if n == "hooks.notify"));
    }

    #[rstest]
    #[case::number(json!(42), "number")]
    #[case::array(json!(["a"]), "array")]
    #[case::object(json!({ "name": "a" }), "object")]
    fn other_json_is_invalid_type(#[case] value: Value, #[case] kind: &str) {
        let err = CallbackRef::try_from(&value).unwrap_err();
        assert_eq!(err, CallbackError::InvalidCallbackType(kind.to_string()));
    }

    #[test]
    fn option_converts_to_absent() {
        let none: Option<&str> = None;
        assert!(CallbackRef::from(none).is_absent());
        assert_eq!(CallbackRef::from(Some("x")).describe(), "x");
    }
}
