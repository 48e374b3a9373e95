//! Wire envelope for the Mirror relay.
//!
//! Every frame exchanged over a host or listener connection carries exactly one
//! [`Envelope`]: a kind tag plus an opaque string payload. The relay never looks
//! inside `content`; editors and viewers own its meaning.
//!
//! ```text
//! {"type": "DATA", "content": "..."}
//! ```

use serde::{Deserialize, Serialize};

/// Kind tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Document content pushed by the host.
    Data,
    /// Join address for the session, sent by the relay to the host.
    Url,
    /// Relay asks the host to re-broadcast its full state.
    Resend,
    /// Cursor/selection update pushed by the host.
    Selection,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Data => "DATA",
            MessageKind::Url => "URL",
            MessageKind::Resend => "RESEND",
            MessageKind::Selection => "SELECTION",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Opaque payload. Empty for `RESEND`.
    #[serde(default)]
    pub content: String,
}

impl Envelope {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn data(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Data, content)
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(MessageKind::Url, url)
    }

    pub fn resend() -> Self {
        Self::new(MessageKind::Resend, String::new())
    }

    pub fn selection(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Selection, content)
    }

    /// Encode as a JSON text frame payload.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from a JSON text frame payload.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decode from raw bytes (binary frames carrying UTF-8 JSON).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
