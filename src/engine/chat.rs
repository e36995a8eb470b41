// Veera Core Engine — Chat helpers
//
// Pure helper functions shared by the turn driver: title derivation,
// display-side markdown cleanup, and attachment preprocessing.
//
// Dependency rule (one-way):
//   engine/chat.rs → engine/types, atoms
//   engine/chat.rs has NO import from turn.rs or sessions.rs.

use crate::atoms::constants::TITLE_MAX_CHARS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::types::ImageAttachment;
use regex::Regex;
use std::sync::LazyLock;

// ── Title derivation ───────────────────────────────────────────────────────

/// Session title from the first user message: the first 30 characters,
/// plus an ellipsis when the message is longer. Counts characters, not
/// bytes, so multibyte text is never split.
pub fn derive_title(first_message: &str) -> String {
    let mut title: String = first_message.chars().take(TITLE_MAX_CHARS).collect();
    if first_message.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

// ── Markdown cleanup ───────────────────────────────────────────────────────

/// `#` through `######`, with the single space that usually follows.
static MD_HEADERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#{1,6}\s?").expect("header pattern compiles"));

/// Strip the markdown artifacts the model emits despite the persona
/// stricture: header markers, `**` bold markers, and `__` markers.
/// Applied to display targets only — stored message text stays raw.
pub fn strip_markdown(text: &str) -> String {
    MD_HEADERS.replace_all(text, "").replace("**", "").replace("__", "")
}

// ── Attachment preprocessing ───────────────────────────────────────────────

/// Parse a `data:<mime>;base64,<payload>` URL into an attachment.
/// The payload is decoded once to validate it, then kept in its encoded
/// form — that is what both the session blob and the Gemini request carry.
pub fn attachment_from_data_url(url: &str) -> EngineResult<ImageAttachment> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| EngineError::from("attachment is not a data URL"))?;
    let (mime_type, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| EngineError::from("attachment data URL has no base64 payload"))?;

    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| EngineError::Other(format!("attachment payload is not valid base64: {e}")))?;

    Ok(ImageAttachment {
        mime_type: mime_type.to_string(),
        data: payload.to_string(),
    })
}
