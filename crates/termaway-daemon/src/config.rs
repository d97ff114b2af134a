use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::DaemonError;
use crate::paths::TermawayPaths;

/// Daemon configuration.
///
/// Read from the `[server]` section of `~/.termaway/config.toml`, then
/// overridden by CLI flags and environment variables in `main`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Listen address. Default: all interfaces.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Listen port. Default: 3000. Port 0 binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared password. None = no authentication required.
    #[serde(default)]
    pub password: Option<String>,

    /// Certificate directory holding `server.crt` + `server.key`.
    /// None = `~/.termaway/certs`. TLS is enabled iff both files exist.
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,

    /// Service name for local network discovery advertisement.
    /// The advertisement itself is handled by the host application; the
    /// daemon only logs the configured name.
    #[serde(default)]
    pub service_name: Option<String>,

    /// Per-session scrollback cap in bytes.
    /// Default: 2000000
    #[serde(default = "default_scrollback_max_bytes")]
    pub scrollback_max_bytes: usize,

    /// Maximum bytes per `output` frame during scrollback replay.
    /// Default: 100000
    #[serde(default = "default_replay_chunk_bytes")]
    pub replay_chunk_bytes: usize,

    /// Pacing gap between scrollback replay frames in milliseconds.
    /// Default: 50
    #[serde(default = "default_replay_gap_ms")]
    pub replay_gap_ms: u64,

    /// Minimum interval between applied PTY resizes in milliseconds.
    /// Default: 100
    #[serde(default = "default_resize_cooldown_ms")]
    pub resize_cooldown_ms: u64,

    /// Shared clipboard cap in bytes.
    /// Default: 1048576 (1 MiB)
    #[serde(default = "default_clipboard_max_bytes")]
    pub clipboard_max_bytes: usize,

    /// Heartbeat tick interval in seconds.
    /// Default: 30
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Authentication rate-limit window in milliseconds.
    /// Default: 60000
    #[serde(default = "default_auth_window_ms")]
    pub auth_window_ms: u64,

    /// Failed attempts allowed per address per window.
    /// Default: 5
    #[serde(default = "default_auth_max_attempts")]
    pub auth_max_attempts: u32,
}

impl DaemonConfig {
    /// Validate configuration values.
    ///
    /// Called after loading config to catch misconfiguration early.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.scrollback_max_bytes == 0 {
            return Err(DaemonError::ConfigInvalid(
                "scrollback_max_bytes must be > 0".to_string(),
            ));
        }
        if self.replay_chunk_bytes == 0 {
            return Err(DaemonError::ConfigInvalid(
                "replay_chunk_bytes must be > 0".to_string(),
            ));
        }
        if self.clipboard_max_bytes == 0 {
            return Err(DaemonError::ConfigInvalid(
                "clipboard_max_bytes must be > 0".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(DaemonError::ConfigInvalid(
                "heartbeat_interval_secs must be > 0".to_string(),
            ));
        }
        if self.auth_max_attempts == 0 {
            return Err(DaemonError::ConfigInvalid(
                "auth_max_attempts must be > 0".to_string(),
            ));
        }
        if let Some(password) = &self.password
            && password.is_empty()
        {
            return Err(DaemonError::ConfigInvalid(
                "password must be non-empty when set".to_string(),
            ));
        }
        Ok(())
    }

    /// The certificate directory, falling back to `~/.termaway/certs`.
    pub fn resolved_cert_dir(&self, paths: &TermawayPaths) -> PathBuf {
        self.cert_dir
            .clone()
            .unwrap_or_else(|| paths.certs_dir())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            password: None,
            cert_dir: None,
            service_name: None,
            scrollback_max_bytes: default_scrollback_max_bytes(),
            replay_chunk_bytes: default_replay_chunk_bytes(),
            replay_gap_ms: default_replay_gap_ms(),
            resize_cooldown_ms: default_resize_cooldown_ms(),
            clipboard_max_bytes: default_clipboard_max_bytes(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            auth_window_ms: default_auth_window_ms(),
            auth_max_attempts: default_auth_max_attempts(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    3000
}

fn default_scrollback_max_bytes() -> usize {
    2_000_000
}

fn default_replay_chunk_bytes() -> usize {
    100_000
}

fn default_replay_gap_ms() -> u64 {
    50
}

fn default_resize_cooldown_ms() -> u64 {
    100
}

fn default_clipboard_max_bytes() -> usize {
    1_048_576
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_auth_window_ms() -> u64 {
    60_000
}

fn default_auth_max_attempts() -> u32 {
    5
}

/// Wrapper for deserializing the `[server]` section from a config file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: DaemonConfig,
}

/// Load daemon configuration from `~/.termaway/config.toml`.
///
/// Reads the `[server]` section. Falls back to defaults if the file doesn't
/// exist or fails to parse; parse failures are logged, not fatal.
pub fn load_daemon_config(paths: &TermawayPaths) -> Result<DaemonConfig, DaemonError> {
    let config_path = paths.user_config();

    let config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.server,
            Err(e) => {
                tracing::warn!(
                    event = "daemon.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "daemon.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 3000);
        assert!(config.bind.is_unspecified());
        assert!(config.password.is_none());
        assert_eq!(config.scrollback_max_bytes, 2_000_000);
        assert_eq!(config.replay_chunk_bytes, 100_000);
        assert_eq!(config.replay_gap_ms, 50);
        assert_eq!(config.resize_cooldown_ms, 100);
        assert_eq!(config.clipboard_max_bytes, 1_048_576);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.auth_window_ms, 60_000);
        assert_eq!(config.auth_max_attempts, 5);
    }

    #[test]
    fn test_validate_defaults_ok() {
        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_scrollback_fails() {
        let mut config = DaemonConfig::default();
        config.scrollback_max_bytes = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scrollback_max_bytes"));
    }

    #[test]
    fn test_validate_empty_password_fails() {
        let mut config = DaemonConfig::default();
        config.password = Some(String::new());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_parse_server_section() {
        let toml = r#"
[server]
port = 4000
bind = "127.0.0.1"
password = "hunter2"
scrollback_max_bytes = 4096
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.server.port, 4000);
        assert_eq!(file.server.bind.to_string(), "127.0.0.1");
        assert_eq!(file.server.password.as_deref(), Some("hunter2"));
        assert_eq!(file.server.scrollback_max_bytes, 4096);
        // Defaults for unset fields
        assert_eq!(file.server.replay_chunk_bytes, 100_000);
    }

    #[test]
    fn test_parse_missing_section_uses_defaults() {
        let toml = r#"
[advertise]
name = "my-mac"
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.server.port, 3000);
        assert!(file.server.password.is_none());
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TermawayPaths::from_dir(dir.path().to_path_buf());
        std::fs::write(paths.user_config(), "[server]\nport = 4100\n").unwrap();
        let config = load_daemon_config(&paths).unwrap();
        assert_eq!(config.port, 4100);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TermawayPaths::from_dir(dir.path().join("nope"));
        let config = load_daemon_config(&paths).unwrap();
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_resolved_cert_dir_fallback() {
        let paths = TermawayPaths::from_dir(PathBuf::from("/tmp/.termaway"));
        let config = DaemonConfig::default();
        assert_eq!(
            config.resolved_cert_dir(&paths),
            PathBuf::from("/tmp/.termaway/certs")
        );

        let mut config = DaemonConfig::default();
        config.cert_dir = Some(PathBuf::from("/etc/termaway"));
        assert_eq!(
            config.resolved_cert_dir(&paths),
            PathBuf::from("/etc/termaway")
        );
    }
}
