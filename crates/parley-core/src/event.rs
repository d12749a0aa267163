//! Domain events published on the event bus.
//!
//! Events are plain data. A publisher builds one with the consuming setters
//! and hands it off; from then on it is shared read-only between
//! subscribers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known topic names.
pub mod topics {
    pub const MESSAGE_RECEIVED: &str = "message.received";
    pub const COMMAND_EXECUTED: &str = "command.executed";
    pub const USER_ACTION: &str = "user.action";
    pub const STATE_CHANGED: &str = "state.changed";
    pub const ERROR_OCCURRED: &str = "error.occurred";
    pub const MODULE_LIFECYCLE: &str = "module.lifecycle";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    /// Creation time in unix seconds.
    pub timestamp: u64,
    pub source: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
}

impl Event {
    pub fn new(topic: impl Into<String>, source: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            topic: topic.into(),
            timestamp,
            source: source.into(),
            data: Map::new(),
            user_id: None,
            chat_id: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Shorthand for a string field in `data`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn message_received(user_id: i64, chat_id: i64, text: impl Into<String>) -> Self {
        Self::new(topics::MESSAGE_RECEIVED, "router")
            .with_user(user_id)
            .with_chat(chat_id)
            .with_data("text", text.into())
    }

    pub fn command_executed(
        user_id: i64,
        command: impl Into<String>,
        module: impl Into<String>,
        success: bool,
    ) -> Self {
        Self::new(topics::COMMAND_EXECUTED, "router")
            .with_user(user_id)
            .with_data("command", command.into())
            .with_data("module", module.into())
            .with_data("success", success)
    }

    pub fn module_lifecycle(module: impl Into<String>, phase: &str) -> Self {
        Self::new(topics::MODULE_LIFECYCLE, "router")
            .with_data("module", module.into())
            .with_data("phase", phase)
    }

    pub fn error_occurred(source: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::new(topics::ERROR_OCCURRED, source).with_data("error", error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters() {
        let event = Event::new("order.created", "shop")
            .with_user(5)
            .with_chat(9)
            .with_data("order_id", 42);

        assert_eq!(event.topic, "order.created");
        assert_eq!(event.user_id, Some(5));
        assert_eq!(event.chat_id, Some(9));
        assert_eq!(event.get("order_id"), Some(&Value::from(42)));
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_well_known_constructors() {
        let event = Event::command_executed(1, "/start", "greeter", true);
        assert_eq!(event.topic, topics::COMMAND_EXECUTED);
        assert_eq!(event.get_str("module"), Some("greeter"));

        let event = Event::module_lifecycle("greeter", "started");
        assert_eq!(event.get_str("phase"), Some("started"));
    }
}
