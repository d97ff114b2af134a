use std::io;

/// All error types for the termaway-daemon crate.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Invalid session name")]
    InvalidName,

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Not attached to any session")]
    NotAttached,

    #[error("Session disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to spawn shell: {0}")]
    Spawn(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Clipboard content too large")]
    ClipboardTooLarge,

    #[error("Clipboard content must be a string")]
    InvalidClipboard,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DaemonError {
    /// Stable error code string, used in structured logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::InvalidName => "invalid_name",
            DaemonError::AlreadyExists(_) => "already_exists",
            DaemonError::NotFound(_) => "not_found",
            DaemonError::NotAttached => "not_attached",
            DaemonError::Disconnected(_) => "disconnected",
            DaemonError::Spawn(_) => "spawn_failed",
            DaemonError::Pty(_) => "pty_error",
            DaemonError::ClipboardTooLarge => "clipboard_too_large",
            DaemonError::InvalidClipboard => "invalid_clipboard",
            DaemonError::TlsConfig(_) => "tls_config_error",
            DaemonError::ConfigInvalid(_) => "config_invalid",
            DaemonError::Io(_) => "io_error",
            DaemonError::Serde(_) => "serialization_error",
        }
    }

    /// Whether this error is caused by client input rather than daemon state.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DaemonError::InvalidName
                | DaemonError::AlreadyExists(_)
                | DaemonError::NotFound(_)
                | DaemonError::NotAttached
                | DaemonError::ClipboardTooLarge
                | DaemonError::InvalidClipboard
        )
    }
}
