use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reusable unit of logic that jobs instantiate.
///
/// The orchestration core only reads task definitions: the payload is shipped
/// to the host untouched, and `timeout` overrides the deployment-wide job
/// timeout when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub host_group: Option<String>,
    #[serde(default, with = "optional_secs")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host_group: None,
            timeout: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_host_group(mut self, group: impl Into<String>) -> Self {
        self.host_group = Some(group.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Run time allowed for jobs of this task.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// Timeouts are written as whole seconds (`timeout = 600`) in config files.
mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
