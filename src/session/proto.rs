use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Positional arguments carried by publish, event, call and invoke messages.
pub type Args = Vec<Value>;
/// Keyword arguments carried by publish, event, call and invoke messages.
pub type Kwargs = Map<String, Value>;

/// Server-assigned identifier (session or subscription).
///
/// Peers send either JSON strings or non-negative integers; the received
/// representation is preserved so ids echo back exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpaqueId {
    Number(u64),
    Text(String),
}

impl fmt::Display for OpaqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<u64> for OpaqueId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for OpaqueId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OpaqueId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbortDetails {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Hello,
    Subscribe {
        request_id: u64,
        topic: String,
    },
    Unsubscribe {
        request_id: u64,
        topic: String,
    },
    Publish {
        request_id: u64,
        topic: String,
        args: Args,
        kwargs: Kwargs,
    },
    Register {
        request_id: u64,
        procedure: String,
    },
    Unregister {
        request_id: u64,
        procedure: String,
    },
    Call {
        request_id: u64,
        procedure: String,
        args: Args,
        kwargs: Kwargs,
    },
    Yield {
        invoke_id: u64,
        result: Value,
    },
    Error {
        invoke_id: u64,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        session_id: OpaqueId,
    },
    Abort {
        details: AbortDetails,
    },
    Subscribed {
        request_id: u64,
        subscription_id: OpaqueId,
    },
    Unsubscribed {
        request_id: u64,
    },
    Published {
        request_id: u64,
    },
    Registered {
        request_id: u64,
    },
    Unregistered {
        request_id: u64,
    },
    Event {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<OpaqueId>,
        #[serde(default)]
        args: Args,
        #[serde(default)]
        kwargs: Kwargs,
    },
    Invoke {
        invoke_id: u64,
        procedure: String,
        #[serde(default)]
        args: Args,
        #[serde(default)]
        kwargs: Kwargs,
    },
    Result {
        request_id: u64,
        #[serde(default)]
        result: Value,
    },
    /// Failure reply. Carries `requestId` for our requests, or `invokeId`
    /// when the peer rejects one of our invocation replies.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invoke_id: Option<u64>,
        message: String,
    },
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire tag of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Publish { .. } => "publish",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Call { .. } => "call",
            Self::Yield { .. } => "yield",
            Self::Error { .. } => "error",
        }
    }

    /// Correlation id for request-bearing messages.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Subscribe { request_id, .. }
            | Self::Unsubscribe { request_id, .. }
            | Self::Publish { request_id, .. }
            | Self::Register { request_id, .. }
            | Self::Unregister { request_id, .. }
            | Self::Call { request_id, .. } => Some(*request_id),
            Self::Hello | Self::Yield { .. } | Self::Error { .. } => None,
        }
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire tag of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Abort { .. } => "abort",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Published { .. } => "published",
            Self::Registered { .. } => "registered",
            Self::Unregistered { .. } => "unregistered",
            Self::Event { .. } => "event",
            Self::Invoke { .. } => "invoke",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }
}
