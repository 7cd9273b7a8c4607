//! Wire messages exchanged with design-tool plugin connections.
//!
//! Every frame is a JSON object with a `kind` discriminator and camelCase
//! fields. Outbound frames are modeled loosely (the command payloads are
//! opaque to the relay); inbound frames are parsed into [`ClientMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ClientId, RequestId};

/// Server → client message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutboundKind {
    Connected,
    Create,
    GetSelection,
    UpdateNode,
    ReplaceChild,
    InsertChild,
    DeleteNode,
    Pong,
    AnalysisResult,
}

impl OutboundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Create => "create",
            Self::GetSelection => "get-selection",
            Self::UpdateNode => "update-node",
            Self::ReplaceChild => "replace-child",
            Self::InsertChild => "insert-child",
            Self::DeleteNode => "delete-node",
            Self::Pong => "pong",
            Self::AnalysisResult => "analysis-result",
        }
    }
}

impl std::fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server → client frame: `kind`, optional correlation id and timestamp,
/// plus an opaque kind-specific body flattened into the same object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub kind: OutboundKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl RelayMessage {
    pub fn new(kind: OutboundKind) -> Self {
        Self {
            kind,
            request_id: None,
            timestamp: None,
            body: Map::new(),
        }
    }

    /// Add a body field. A numeric `timestamp` becomes the envelope
    /// timestamp; other reserved envelope keys are ignored.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        match key {
            "timestamp" => {
                if let Some(ts) = value.as_i64() {
                    self.timestamp = Some(ts);
                }
            }
            "kind" | "requestId" => {}
            _ => {
                let _ = self.body.insert(key.to_owned(), value);
            }
        }
        self
    }

    /// Merge every field of a JSON object into the body.
    pub fn with_fields(self, fields: Map<String, Value>) -> Self {
        fields
            .into_iter()
            .fold(self, |msg, (k, v)| msg.with_field(&k, v))
    }

    /// Set the timestamp to now unless one is already present.
    pub fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// The acknowledgement sent to a freshly accepted connection.
    pub fn connected(client_id: &ClientId) -> Self {
        Self::new(OutboundKind::Connected)
            .with_field("clientId", Value::String(client_id.to_string()))
    }

    pub fn pong() -> Self {
        let mut msg = Self::new(OutboundKind::Pong);
        msg.stamp();
        msg
    }
}

/// Client → server frames.
///
/// Unknown kinds deserialize to [`ClientMessage::Unknown`] so newer plugins
/// can send frames this relay does not understand yet.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientMessage {
    Ping,
    #[serde(rename_all = "camelCase")]
    Selection {
        #[serde(default)]
        request_id: Option<RequestId>,
        #[serde(default = "empty_array")]
        nodes: Value,
    },
    #[serde(rename_all = "camelCase")]
    OperationResult {
        #[serde(default)]
        request_id: Option<RequestId>,
        success: bool,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Variables {
        #[serde(default = "empty_array")]
        variables: Value,
    },
    #[serde(rename_all = "camelCase")]
    Analyze {
        #[serde(default)]
        request_id: Option<RequestId>,
        content: String,
        #[serde(default)]
        instructions: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

fn empty_array() -> Value {
    Value::Array(Vec::new())
}

/// Number of entries in an opaque report: array or object length, zero for
/// `null`, one for any other scalar.
pub fn payload_count(payload: &Value) -> usize {
    match payload {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        _ => 1,
    }
}

/// Text of a remote `error` field. Strings pass through, objects yield their
/// `message` when it is a string, anything else is rendered as JSON.
pub fn error_reason(error: Option<Value>) -> Option<String> {
    match error? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(m)) => Some(m.clone()),
            _ => Some(Value::Object(map).to_string()),
        },
        other => Some(other.to_string()),
    }
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Selection { .. } => "selection",
            Self::OperationResult { .. } => "operation-result",
            Self::Variables { .. } => "variables",
            Self::Analyze { .. } => "analyze",
            Self::Unknown => "unknown",
        }
    }
}
