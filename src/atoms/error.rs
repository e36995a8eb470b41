// ── Veera Atoms: Error Types ───────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, Provider, Config…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • `EngineError` → `String` conversion is provided via `Display` so that
//     embedding boundaries (`Result<T, String>`) can call `.map_err(|e|
//     e.to_string())` without boilerplate.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Inference backend HTTP or API-level failure (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Session store failure (blob backend, invalid session/message id).
    #[error("Store error: {0}")]
    Store(String),

    /// Engine configuration is invalid or missing (e.g. no API key).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a provider error with name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
/// At embedding boundaries, convert with `.map_err(|e| e.to_string())`.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ──────────────────────────────────────

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
