// Veera Core Engine — Core types
// These are the data structures that flow through the entire engine.
// Serialized field names match the JSON the original client persisted
// (camelCase, optional flags omitted when unset), so existing saved
// session blobs load unchanged.

use crate::atoms::constants::{
    DEFAULT_SESSION_TITLE, DEFAULT_THINKING_BUDGET, MODEL_FLASH, MODEL_PRO,
};
use serde::{Deserialize, Serialize};

// ── Roles ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

// ── Message parts ──────────────────────────────────────────────────────

/// Inline binary attachment: mime type + base64-encoded bytes.
/// Shape matches Gemini's `inlineData` payload, so it passes straight
/// through to the request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAttachment {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// One part of a message: a text fragment or an inline attachment.
/// Untagged — the wire format is `{"text": …}` or `{"inlineData": …}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessagePart {
    Text { text: String },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: ImageAttachment,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn inline(attachment: ImageAttachment) -> Self {
        MessagePart::Inline { inline_data: attachment }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePart::Text { text } => Some(text),
            MessagePart::Inline { .. } => None,
        }
    }
}

// ── Grounding sources ──────────────────────────────────────────────────

/// A citation surfaced by search grounding. Identity for deduplication is
/// the full (title, uri) pair — literal equality, nothing normalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

impl GroundingSource {
    pub fn new(title: impl Into<String>, uri: impl Into<String>) -> Self {
        GroundingSource { title: title.into(), uri: uri.into() }
    }
}

// ── Messages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Set while the streaming process is still writing this message.
    /// Once cleared the message is immutable.
    #[serde(rename = "isStreaming", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_streaming: bool,
    #[serde(rename = "groundingSources", default, skip_serializing_if = "Option::is_none")]
    pub grounding_sources: Option<Vec<GroundingSource>>,
}

impl Message {
    /// A user turn: the text plus an optional image attachment.
    pub fn user(text: impl Into<String>, image: Option<ImageAttachment>) -> Self {
        let mut parts = vec![MessagePart::text(text)];
        if let Some(att) = image {
            parts.push(MessagePart::inline(att));
        }
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            parts,
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_streaming: false,
            grounding_sources: None,
        }
    }

    /// The empty in-progress model message a turn starts with.
    pub fn placeholder() -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Model,
            parts: vec![MessagePart::text("")],
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_streaming: true,
            grounding_sources: None,
        }
    }

    /// All text parts joined into one logical string.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(|p| p.as_text()).collect()
    }

    /// Replace the message body with a single text part.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.parts = vec![MessagePart::text(text)];
    }
}

// ── Sessions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub model: String,
    /// Epoch milliseconds.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl ChatSession {
    pub fn new(model: impl Into<String>) -> Self {
        ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            model: model.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// ── Per-turn settings ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSettings {
    pub model: String,
    #[serde(rename = "useSearch")]
    pub use_search: bool,
    #[serde(rename = "useThinking")]
    pub use_thinking: bool,
    #[serde(rename = "thinkingBudget")]
    pub thinking_budget: u32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        ChatSettings {
            model: MODEL_FLASH.to_string(),
            use_search: true,
            use_thinking: false,
            thinking_budget: DEFAULT_THINKING_BUDGET,
        }
    }
}

// ── Model catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

/// The model variants the client offers.
pub const MODEL_CATALOG: [ModelInfo; 2] = [
    ModelInfo {
        id: MODEL_FLASH,
        name: "Veera Flash",
        description: "Instant responses with high speed sync",
    },
    ModelInfo {
        id: MODEL_PRO,
        name: "Veera Ultra",
        description: "Full reasoning capacity & data grounding",
    },
];

// ── Stream events (client → accumulator) ───────────────────────────────

/// One partial-response event from the remote client.
///
/// `text` carries the CUMULATIVE text-so-far, not a delta — the client
/// folds wire deltas before emitting. `sources` carries the citation
/// records seen in this event only; pairs may repeat across events and
/// the accumulator is responsible for deduplication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamEvent {
    pub text: String,
    pub sources: Vec<GroundingSource>,
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent { text: text.into(), sources: Vec::new() }
    }

    pub fn with_sources(text: impl Into<String>, sources: Vec<GroundingSource>) -> Self {
        StreamEvent { text: text.into(), sources }
    }
}

/// The accumulator's materialized view after an event: full text so far
/// plus the deduplicated, first-seen-ordered citation list. Transient —
/// superseded snapshots are simply dropped, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    pub text: String,
    pub sources: Vec<GroundingSource>,
}

// ── Placeholder lifecycle ──────────────────────────────────────────────

/// Lifecycle of the in-progress model message during one turn.
/// Settled requires the pacer to have caught up AND the stream to have
/// ended; Failed is reachable from Pending or Streaming and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Placeholder created, no events yet.
    Pending,
    /// Events arriving, pacer active.
    Streaming,
    /// Stream ended cleanly, pacer draining buffered characters.
    Finalizing,
    /// Visible caught up to the final target; message immutable.
    Settled,
    /// Transport error; message rewritten with the failure notice.
    Failed,
}

impl TurnPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnPhase::Settled | TurnPhase::Failed)
    }
}

// ── Engine events (engine → embedder) ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatEvent {
    /// The in-progress model placeholder was appended to the session
    #[serde(rename = "placeholder")]
    Placeholder {
        session_id: String,
        message_id: String,
    },
    /// Stream active but no text yet — show a pending indicator
    #[serde(rename = "thinking")]
    Thinking {
        session_id: String,
        message_id: String,
    },
    /// Newly revealed characters (typically one per tick)
    #[serde(rename = "reveal")]
    Reveal {
        session_id: String,
        message_id: String,
        text: String,
    },
    /// The visible text was rewritten wholesale (target shrank / clamp)
    #[serde(rename = "replace")]
    Replace {
        session_id: String,
        message_id: String,
        text: String,
    },
    /// The deduplicated citation set grew
    #[serde(rename = "sources")]
    Sources {
        session_id: String,
        message_id: String,
        sources: Vec<GroundingSource>,
    },
    /// The turn settled cleanly; `text` is the final message text
    #[serde(rename = "complete")]
    Complete {
        session_id: String,
        message_id: String,
        text: String,
    },
    /// The turn failed; `message` is the rewritten message text
    #[serde(rename = "failed")]
    Failed {
        session_id: String,
        message_id: String,
        message: String,
    },
}
