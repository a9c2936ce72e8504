use serde::{Deserialize, Serialize};
use serde_json::Value;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wire request envelope, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub command: String,
    pub timestamp: i64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<String>, command: impl Into<String>, data: Value, metadata: Option<Value>) -> Self {
        Self {
            id: id.into(),
            command: command.into().to_uppercase(),
            timestamp: now_millis(),
            data,
            metadata,
        }
    }
}

/// Wire response error payload, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Wire response envelope, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub timestamp: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseEnvelope {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            timestamp: now_millis(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, err: &crate::error::Error) -> Self {
        Self {
            id: id.into(),
            timestamp: now_millis(),
            success: false,
            data: None,
            error: Some(ResponseError {
                code: err.code().to_string(),
                message: err.to_string(),
                details: err.details().cloned(),
                stack: None,
            }),
        }
    }
}

/// Wire event envelope, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub data: Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl EventEnvelope {
    pub fn new(event_name: impl Into<String>, data: Value, metadata: Option<Value>) -> Self {
        Self {
            event_name: event_name.into(),
            data,
            timestamp: now_millis(),
            metadata,
        }
    }
}
