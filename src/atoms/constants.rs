// ── Veera Atoms: Constants ─────────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Session persistence ────────────────────────────────────────────────────
// The whole session list is serialized as one JSON blob under this key.
// Existing installs have their data stored under it — treat as a stable
// identifier; changing it would orphan every saved conversation.
pub const SESSIONS_STORAGE_KEY: &str = "veera_ai_sessions";

/// Directory under the user's home where the default blob backend writes.
pub(crate) const STORE_DIR_NAME: &str = ".veera";

// ── Display pacing ─────────────────────────────────────────────────────────
// One character is revealed per tick. 15 ms/char reads as smooth typing
// without lagging noticeably behind short responses.
pub const REVEAL_INTERVAL_MS: u64 = 15;

// ── Session titles ─────────────────────────────────────────────────────────
pub const DEFAULT_SESSION_TITLE: &str = "New Intelligence Task";

/// A session is titled from its first user message, truncated to this many
/// characters (plus an ellipsis when longer).
pub(crate) const TITLE_MAX_CHARS: usize = 30;

// ── Failure notice ─────────────────────────────────────────────────────────
// Appended verbatim to whatever text was already revealed when the stream
// dies. User-facing copy — coordinate with the frontend before editing.
pub const STREAM_FAILURE_NOTICE: &str =
    "⚠️ Real-time sync interrupted. Please check your connection to the data grid.";

// ── Models ─────────────────────────────────────────────────────────────────
pub const MODEL_FLASH: &str = "gemini-3-flash-preview";
pub const MODEL_PRO: &str = "gemini-3-pro-preview";

/// Default extended-thinking token budget when `useThinking` is on.
pub const DEFAULT_THINKING_BUDGET: u32 = 16000;

/// Extra output-token headroom granted on top of the thinking budget.
pub(crate) const THINKING_OUTPUT_MARGIN: u32 = 4096;

// ── Gemini API ─────────────────────────────────────────────────────────────
pub(crate) const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Persona prompt sent as the systemInstruction on every request.
/// The markdown stricture is only advisory to the model — cleanup still
/// happens on the display path (see engine::chat::strip_markdown).
pub(crate) const SYSTEM_INSTRUCTION: &str = "You are Veera AI, developed by Abinash Kumar and owned by Veera. STRICTURE: You must NOT use markdown headers (e.g., #, ##, ###) or bold markers (e.g., **). Output plain, clean text only. If asked about your origin, mention Abinash Kumar and Veera. Be professional, direct, and fast.";
