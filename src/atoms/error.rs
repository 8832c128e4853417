// ── wa-connect Atoms: Error Types ──────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Config…) plus the four
//     connection-manager failure classes (Setup, Transport, Persistence, Encoding).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • The public manager API never returns this type; failures are turned into
//     an `ErrorRecord` on the bot's snapshot instead (see `types::ErrorRecord`).
//   • No variant carries credential material in its message.

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

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Manager configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Working Area creation or transport open failed before an attempt was registered.
    #[error("Setup error: {0}")]
    Setup(String),

    /// Transport-level failure outside of a classified disconnect.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credential read or DB write failed while persisting a paired session.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// QR conversion failed. Non-fatal: callers fall back to the raw payload.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Re-tag any error as a persistence failure, keeping its message.
    /// Used by the Persistence Writer so every failure on that path surfaces
    /// with the same category regardless of where it originated.
    pub fn into_persistence(self) -> Self {
        match self {
            e @ EngineError::Persistence(_) => e,
            other => EngineError::Persistence(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(e: toml::ser::Error) -> Self {
        EngineError::Config(e.to_string())
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
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
