//! Task queue configuration: one record per backend family, keyed by `type`.
//!
//! The tag is read before anything else so an unknown backend is reported as
//! `UnknownBackendType` rather than as a generic deserialisation error.

pub mod backend;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Result, TaskQueueError};

pub use self::backend::{BackendFamily, BackendProperties, ConnectionInfo, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Immediate work-queue engine.
    Rq,
    /// Lightweight consumer/producer queue.
    Huey,
    /// Persistent scheduler with data store + event broker.
    #[serde(rename = "apscheduler")]
    ApScheduler,
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Rq => "rq",
            BackendType::Huey => "huey",
            BackendType::ApScheduler => "apscheduler",
        }
    }
}

impl FromStr for BackendType {
    type Err = TaskQueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rq" | "work-queue" => Ok(BackendType::Rq),
            "huey" | "lightweight-queue" => Ok(BackendType::Huey),
            "apscheduler" | "persistent-scheduler" => Ok(BackendType::ApScheduler),
            _ => Err(TaskQueueError::UnknownBackendType(s.to_string())),
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_queue() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RqConfig {
    pub uri: String,
    #[serde(default = "default_queue")]
    pub queue: String,
}

impl RqConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            queue: default_queue(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HueyConfig {
    pub uri: String,
    pub consumer_name: String,
}

impl HueyConfig {
    pub fn new(uri: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            consumer_name: consumer_name.into(),
        }
    }
}

/// Connection settings for one apscheduler collaborator.
///
/// Either `uri`, or `backend` plus optional parts filled from the family defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendFamily>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl EndpointConfig {
    pub fn uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    pub fn family(backend: BackendFamily) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    pub fn resolve_uri(&self) -> Result<String> {
        if let Some(uri) = &self.uri {
            if uri.trim().is_empty() {
                return Err(TaskQueueError::Configuration("empty uri".into()));
            }
            return Ok(uri.clone());
        }
        let family = self.backend.ok_or_else(|| {
            TaskQueueError::Configuration("either `uri` or `backend` must be set".into())
        })?;
        Ok(family.build_uri(
            self.host.as_deref(),
            self.port,
            self.database.as_deref(),
            self.username.as_deref(),
            self.password.as_deref(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApSchedulerConfig {
    pub data_store: EndpointConfig,
    /// Absent means an in-process broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_broker: Option<EndpointConfig>,
}

impl ApSchedulerConfig {
    pub fn new(data_store: EndpointConfig) -> Self {
        Self {
            data_store,
            event_broker: None,
        }
    }

    pub fn with_event_broker(mut self, event_broker: EndpointConfig) -> Self {
        self.event_broker = Some(event_broker);
        self
    }

    pub fn event_broker_uri(&self) -> Result<String> {
        match &self.event_broker {
            Some(endpoint) => endpoint.resolve_uri(),
            None => Ok(BackendFamily::Memory.build_uri(None, None, None, None, None)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskQueueConfiguration {
    #[serde(rename = "rq")]
    Rq(RqConfig),
    #[serde(rename = "huey")]
    Huey(HueyConfig),
    #[serde(rename = "apscheduler")]
    ApScheduler(ApSchedulerConfig),
}

impl TaskQueueConfiguration {
    pub fn backend_type(&self) -> BackendType {
        match self {
            TaskQueueConfiguration::Rq(_) => BackendType::Rq,
            TaskQueueConfiguration::Huey(_) => BackendType::Huey,
            TaskQueueConfiguration::ApScheduler(_) => BackendType::ApScheduler,
        }
    }

    /// Parse from a JSON object; the `type` tag decides the variant.
    pub fn from_value(value: Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskQueueError::Configuration("missing string field `type`".into()))?;
        let backend: BackendType = tag.parse()?;

        let config = match backend {
            BackendType::Rq => TaskQueueConfiguration::Rq(decode(value)?),
            BackendType::Huey => TaskQueueConfiguration::Huey(decode(value)?),
            BackendType::ApScheduler => TaskQueueConfiguration::ApScheduler(decode(value)?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| TaskQueueError::Configuration(format!("invalid json: {e}")))?;
        Self::from_value(value)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TaskQueueConfiguration::Rq(c) => {
                require("uri", &c.uri)?;
                require("queue", &c.queue)
            }
            TaskQueueConfiguration::Huey(c) => {
                require("uri", &c.uri)?;
                require("consumer_name", &c.consumer_name)
            }
            TaskQueueConfiguration::ApScheduler(c) => {
                c.data_store.resolve_uri()?;
                c.event_broker_uri().map(|_| ())
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| TaskQueueError::Configuration(e.to_string()))
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TaskQueueError::Configuration(format!(
            "`{field}` must not be empty"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::rq("rq", BackendType::Rq)]
    #[case::rq_alias("work-queue", BackendType::Rq)]
    #[case::huey("huey", BackendType::Huey)]
    #[case::huey_alias("lightweight-queue", BackendType::Huey)]
    #[case::aps("apscheduler", BackendType::ApScheduler)]
    #[case::aps_alias("persistent-scheduler", BackendType::ApScheduler)]
    fn backend_type_from_tag(#[case] tag: &str, #[case] expected: BackendType) {
        assert_eq!(tag.parse::<BackendType>().unwrap(), expected);
    }

    #[test]
    fn unknown_tag_is_named_in_error() {
        let err = TaskQueueConfiguration::from_value(json!({ "type": "celery", "uri": "x" }))
            .unwrap_err();
        assert!(matches!(err, TaskQueueError::UnknownBackendType(ref tag) if tag == "celery"));
    }

    #[test]
    fn rq_config_defaults_queue() {
        let config =
            TaskQueueConfiguration::from_value(json!({ "type": "rq", "uri": "redis://localhost" }))
                .unwrap();
        assert_eq!(
            config,
            TaskQueueConfiguration::Rq(RqConfig::new("redis://localhost"))
        );
        assert_eq!(config.backend_type(), BackendType::Rq);
    }

    #[test]
    fn alias_tag_deserializes_variant() {
        let config = TaskQueueConfiguration::from_value(json!({
            "type": "lightweight-queue",
            "uri": "memory://",
            "consumer_name": "etl",
        }))
        .unwrap();
        assert_eq!(config.backend_type(), BackendType::Huey);
    }

    #[rstest]
    #[case::missing_uri(json!({ "type": "rq" }))]
    #[case::empty_uri(json!({ "type": "rq", "uri": " " }))]
    #[case::missing_consumer(json!({ "type": "huey", "uri": "memory://" }))]
    #[case::empty_consumer(json!({ "type": "huey", "uri": "memory://", "consumer_name": "" }))]
    #[case::missing_store(json!({ "type": "apscheduler" }))]
    #[case::store_without_uri_or_backend(json!({ "type": "apscheduler", "data_store": {} }))]
    #[case::missing_type(json!({ "uri": "memory://" }))]
    fn invalid_config_is_a_configuration_error(#[case] value: Value) {
        assert!(matches!(
            TaskQueueConfiguration::from_value(value),
            Err(TaskQueueError::Configuration(_))
        ));
    }

    #[test]
    fn apscheduler_store_uri_from_parts() {
        let config = TaskQueueConfiguration::from_value(json!({
            "type": "apscheduler",
            "data_store": { "backend": "postgresql", "host": "db", "username": "u", "password": "p" },
            "event_broker": { "backend": "redis" },
        }))
        .unwrap();
        let TaskQueueConfiguration::ApScheduler(aps) = config else {
            panic!("expected apscheduler config");
        };
        assert_eq!(
            aps.data_store.resolve_uri().unwrap(),
            "postgresql://u:p@db:5432/postgres"
        );
        assert_eq!(aps.event_broker_uri().unwrap(), "redis://localhost:6379/0");
    }

    #[test]
    fn apscheduler_without_broker_uses_memory() {
        let aps = ApSchedulerConfig::new(EndpointConfig::uri("memory://jobs"));
        assert_eq!(aps.event_broker_uri().unwrap(), "memory://default");
    }

    #[test]
    fn serializes_with_type_tag() {
        let config = TaskQueueConfiguration::Huey(HueyConfig::new("memory://", "etl"));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], "huey");
        assert_eq!(value["consumer_name"], "etl");
    }
}
