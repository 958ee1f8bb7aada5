//! ServiceAdapter port - 下流サービスへの単一の呼び出し口
//!
//! LLM / 圧縮 / 検索 / engine などの下流サービスはすべて
//! `{action, parameters} -> {result} | {error: ErrorKind}` で呼び出す。
//! タイムアウトは ServiceRegistry 側で掛ける。core はリトライしない。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// ErrorKind は下流サービスのエラー分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Did not answer within the configured timeout.
    Timeout,
    /// Not reachable or not registered.
    Unavailable,
    /// Rejected the action or its parameters.
    InvalidRequest,
    /// Accepted the request and failed while executing it.
    Remote,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What the dispatcher sends, taken from the task payload
/// (`{"action": ..., "parameters": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ServiceRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parameters: Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Reads `{action, parameters}` out of a task payload.
    pub fn from_payload(payload: &Value) -> Result<Self, ServiceError> {
        serde_json::from_value(payload.clone()).map_err(|err| {
            ServiceError::new(
                ErrorKind::InvalidRequest,
                format!("payload is not {{action, parameters}}: {err}"),
            )
        })
    }
}

#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    async fn call(&self, request: ServiceRequest) -> Result<Value, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_read_from_payload() {
        let payload = json!({"action": "summarize", "parameters": {"max_words": 50}});
        let request = ServiceRequest::from_payload(&payload).unwrap();

        assert_eq!(request, ServiceRequest::new("summarize").param("max_words", json!(50)));
    }

    #[test]
    fn parameters_are_optional() {
        let request = ServiceRequest::from_payload(&json!({"action": "ping"})).unwrap();
        assert!(request.parameters.is_empty());
    }

    #[test]
    fn payload_without_action_is_an_invalid_request() {
        let err = ServiceRequest::from_payload(&json!({"text": "hi"})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }
}
