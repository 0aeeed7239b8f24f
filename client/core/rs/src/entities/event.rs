use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::docksmith_timestamp;

/// Topics published by the core. Subscribing to `*` receives all of
/// them.
pub mod topics {
  pub const UPDATE_PROGRESS: &str = "update.progress";
  pub const CHECK_PROGRESS: &str = "check.progress";
  pub const CONTAINER_UPDATED: &str = "container.updated";
  pub const OPERATION_STAGE: &str = "operation.stage";
  pub const OPERATION_COMPLETED: &str = "operation.completed";
  pub const OPERATION_FAILED: &str = "operation.failed";
  pub const WILDCARD: &str = "*";
}

/// A published event. Always JSON-serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
  #[serde(rename = "type")]
  pub typ: String,
  pub payload: Map<String, Value>,
  pub ts: i64,
}

impl Event {
  pub fn new(typ: impl Into<String>) -> Event {
    Event {
      typ: typ.into(),
      payload: Map::new(),
      ts: docksmith_timestamp(),
    }
  }

  pub fn with(
    mut self,
    key: impl Into<String>,
    value: impl Into<Value>,
  ) -> Event {
    self.payload.insert(key.into(), value.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn events_are_json_serializable() {
    let event = Event::new(topics::OPERATION_STAGE)
      .with("operation_id", "op-1")
      .with("stage", "pulling_image")
      .with("percent", 44);
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "operation.stage");
    assert_eq!(json["payload"]["percent"], 44);
    assert!(json["ts"].is_i64());
  }
}
