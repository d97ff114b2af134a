use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found — set $HOME environment variable")]
    HomeNotFound,
}

/// Centralized path construction for the `~/.termaway/` directory layout.
///
/// Single source of truth for every path under `~/.termaway/`. Use
/// `resolve()` in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct TermawayPaths {
    base_dir: PathBuf,
}

impl TermawayPaths {
    /// Resolve paths from the user's home directory (`~/.termaway`).
    pub fn resolve() -> Result<Self, PathError> {
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            base_dir: home.join(".termaway"),
        })
    }

    /// Create paths from an explicit base directory. Use in tests.
    pub fn from_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// The base `~/.termaway` directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// User configuration file: `~/.termaway/config.toml`.
    pub fn user_config(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }

    /// Certificate directory: `~/.termaway/certs`.
    pub fn certs_dir(&self) -> PathBuf {
        self.base_dir.join("certs")
    }

    /// TLS certificate: `~/.termaway/certs/server.crt` (mode 644).
    pub fn tls_cert_path(&self) -> PathBuf {
        self.certs_dir().join("server.crt")
    }

    /// TLS private key: `~/.termaway/certs/server.key` (mode 600).
    pub fn tls_key_path(&self) -> PathBuf {
        self.certs_dir().join("server.key")
    }
}
