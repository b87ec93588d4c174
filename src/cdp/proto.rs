//! CDP wire messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Debug)]
pub struct Command<'a> {
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
}

#[derive(Deserialize, Debug, Clone, thiserror::Error)]
#[error("CDP command failed: {message} (code {code})")]
pub struct CommandError {
    pub code: i64,
    pub message: String,
}

/// Either a command response (`id` set) or an event (`method` set).
#[derive(Deserialize, Debug)]
pub struct Incoming {
    pub id: Option<u64>,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<CommandError>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

impl Incoming {
    pub fn is_response(&self) -> bool {
        self.id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_serialization_omits_empty_fields() {
        let cmd = Command {
            id: 1,
            method: "Target.getTargets",
            params: None,
            session_id: None,
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"id": 1, "method": "Target.getTargets"})
        );

        let cmd = Command {
            id: 2,
            method: "Page.navigate",
            params: Some(json!({"url": "https://example.com"})),
            session_id: Some("SESSION"),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({
                "id": 2,
                "method": "Page.navigate",
                "params": {"url": "https://example.com"},
                "sessionId": "SESSION",
            })
        );
    }

    #[test]
    fn incoming_classification() {
        let response: Incoming =
            serde_json::from_str(r#"{"id": 3, "result": {"ok": true}}"#).unwrap();
        assert!(response.is_response());
        assert!(response.error.is_none());

        let event: Incoming = serde_json::from_str(
            r#"{"method": "Fetch.requestPaused", "params": {}, "sessionId": "S"}"#,
        )
        .unwrap();
        assert!(!event.is_response());
        assert_eq!(event.method.as_deref(), Some("Fetch.requestPaused"));

        let failure: Incoming = serde_json::from_str(
            r#"{"id": 4, "error": {"code": -32601, "message": "unknown method"}}"#,
        )
        .unwrap();
        assert_eq!(failure.error.unwrap().code, -32601);
    }
}
