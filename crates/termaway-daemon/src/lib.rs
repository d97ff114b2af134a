pub mod auth;
pub mod codec;
pub mod config;
pub mod errors;
pub mod logging;
pub mod paths;
pub mod pty;
pub mod server;
pub mod session;
pub mod tls;

// Primary re-exports
pub use config::{DaemonConfig, load_daemon_config};
pub use errors::DaemonError;
pub use server::{run_server, serve};
