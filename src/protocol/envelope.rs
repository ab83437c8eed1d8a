//! Message envelopes with correlation IDs.
//!
//! An [`Envelope`] is the unit the relay stores and hands out. Its serialized
//! form is the wire schema as well as the on-disk record format, one JSON object
//! per line:
//!
//! ```text
//! { "id": "...", "to": "core", "from": "mobile", "text": "hello",
//!   "correlates_with": "...", "ts": 1718000000000 }
//! ```

use serde::{Deserialize, Serialize};

use crate::core::clock::current_timestamp;
use crate::error::{Error, Result};

/// One message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID (sender-supplied or ULID)
    pub id: String,
    /// Recipient party
    #[serde(rename = "to")]
    pub destination: String,
    /// Sender party, absent for legacy callers
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Opaque text content, never blank
    #[serde(rename = "text")]
    pub payload: String,
    /// ID of the message this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlates_with: Option<String>,
    /// Enqueue timestamp (unix ms)
    #[serde(rename = "ts")]
    pub created_at: i64,
}

impl Envelope {
    /// Serialize to a single-line record.
    pub fn to_record(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one stored record.
    ///
    /// Anything that is not a complete, non-blank envelope is a
    /// [`Error::CorruptRecord`]; the error only concerns this record.
    pub fn from_record(record: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(record)
            .map_err(|e| Error::CorruptRecord(e.to_string()))?;

        if envelope.id.trim().is_empty() {
            return Err(Error::CorruptRecord("record has a blank id".to_string()));
        }
        if envelope.destination.trim().is_empty() {
            return Err(Error::CorruptRecord(format!(
                "record {} has a blank destination",
                envelope.id
            )));
        }
        if envelope.payload.trim().is_empty() {
            return Err(Error::CorruptRecord(format!(
                "record {} has a blank payload",
                envelope.id
            )));
        }

        Ok(envelope)
    }

    /// Start a response to this envelope, addressed back to its origin.
    pub fn reply(&self, from: impl Into<String>, text: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::to(self.origin.clone().unwrap_or_default())
            .origin(from)
            .text(text)
            .correlates_with(self.id.clone())
    }

    /// Whether this envelope answers `id`.
    pub fn answers(&self, id: &str) -> bool {
        self.correlates_with.as_deref() == Some(id)
    }
}

/// Builder for envelopes from raw, possibly incomplete fields.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    destination: String,
    origin: Option<String>,
    payload: Option<String>,
    id: Option<String>,
    correlates_with: Option<String>,
    created_at: Option<i64>,
}

impl EnvelopeBuilder {
    /// Start building an envelope for a destination.
    pub fn to(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Set the sender.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the sender if known.
    pub fn maybe_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    /// Set the payload.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.payload = Some(text.into());
        self
    }

    /// Use a sender-supplied ID instead of generating one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the ID if the sender supplied one.
    pub fn maybe_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Set the correlation ID.
    pub fn correlates_with(mut self, id: impl Into<String>) -> Self {
        self.correlates_with = Some(id.into());
        self
    }

    /// Set the correlation ID if present.
    pub fn maybe_correlates_with(mut self, id: Option<String>) -> Self {
        self.correlates_with = id.filter(|id| !id.trim().is_empty());
        self
    }

    /// Pin the creation timestamp.
    pub fn created_at(mut self, ts: i64) -> Self {
        self.created_at = Some(ts);
        self
    }

    /// Build the envelope, stamping missing fields with the current time.
    pub fn build(self) -> Result<Envelope> {
        self.build_at(current_timestamp())
    }

    /// Build the envelope, stamping missing fields with `now_ms`.
    pub fn build_at(self, now_ms: i64) -> Result<Envelope> {
        let payload = match self.payload {
            Some(text) if !text.trim().is_empty() => text,
            _ => return Err(Error::Validation("text is empty".to_string())),
        };

        if self.destination.trim().is_empty() {
            return Err(Error::Validation("destination is empty".to_string()));
        }

        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => generate_id(),
        };

        Ok(Envelope {
            id,
            destination: self.destination,
            origin: self.origin.filter(|o| !o.trim().is_empty()),
            payload,
            correlates_with: self.correlates_with,
            created_at: self.created_at.unwrap_or(now_ms),
        })
    }
}

/// Generate a message ID: millisecond time prefix plus 80 random bits.
pub fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}
