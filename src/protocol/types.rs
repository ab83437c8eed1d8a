//! Request and response bodies exchanged with polling parties.

use serde::{Deserialize, Serialize};

use super::envelope::Envelope;

/// Body accepted by the enqueue endpoints.
///
/// Older clients send `message` instead of `text` and `source` instead of
/// `from`; both spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    /// Recipient (external identifier, resolved by the routing table)
    #[serde(default)]
    pub to: Option<String>,
    /// Sender (external identifier)
    #[serde(default, alias = "source")]
    pub from: Option<String>,
    /// Payload
    #[serde(default, alias = "message")]
    pub text: Option<String>,
    /// Sender-supplied message ID
    #[serde(default)]
    pub id: Option<String>,
    /// ID of the message being answered
    #[serde(default)]
    pub correlates_with: Option<String>,
}

/// Acknowledgment returned for every enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub queued: bool,
    /// Why the message was not queued (validation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Why the message could not be stored (store failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendAck {
    pub fn queued(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            queued: true,
            reason: None,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            id: None,
            queued: false,
            reason: Some(reason.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            id: None,
            queued: false,
            reason: None,
            error: Some(error.into()),
        }
    }
}

/// Single-item poll result: `{"status":"empty"}` or the envelope itself.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Delivery {
    Empty { status: &'static str },
    Message(Envelope),
}

impl From<Option<Envelope>> for Delivery {
    fn from(envelope: Option<Envelope>) -> Self {
        match envelope {
            Some(envelope) => Delivery::Message(envelope),
            None => Delivery::Empty { status: "empty" },
        }
    }
}

/// Bulk poll result.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDelivery {
    pub status: &'static str,
    pub messages: Vec<Envelope>,
}

impl From<Vec<Envelope>> for BatchDelivery {
    fn from(messages: Vec<Envelope>) -> Self {
        Self {
            status: "ok",
            messages,
        }
    }
}
