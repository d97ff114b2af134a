pub mod connection;
pub mod heartbeat;
pub mod registry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use termaway_protocol::ServerFrame;

use crate::auth::RateLimiter;
use crate::config::DaemonConfig;
use crate::errors::DaemonError;
use crate::paths::TermawayPaths;
use crate::pty::output::PtyExitEvent;
use crate::server::registry::ClientRegistry;
use crate::session::manager::SessionManager;
use crate::tls;

/// Shared state constructed once at startup and passed to every task by
/// `Arc`. Each field carries its own lock; no two are held at once except
/// manager-before-registry on broadcast paths.
pub struct ServerState {
    pub config: DaemonConfig,
    pub manager: RwLock<SessionManager>,
    pub registry: RwLock<ClientRegistry>,
    pub limiter: Mutex<RateLimiter>,
}

/// Run the daemon: bind the configured address and serve until a signal.
///
/// This is the entrypoint used by `main`. It:
/// 1. Installs the SIGTERM/SIGINT handler
/// 2. Binds one TCP listener on the configured address and port
/// 3. Chooses TLS or plaintext based on the certificate directory
/// 4. Accepts connections until shutdown, then kills every session
pub async fn run_server(config: DaemonConfig) -> Result<(), DaemonError> {
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let listener = TcpListener::bind((config.bind, config.port)).await?;
    serve(listener, config, shutdown).await
}

/// Turn the first SIGINT/SIGTERM into a cancelled shutdown token, so the
/// accept loop, the heartbeat, and every per-connection child token
/// unwind together.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let signal = wait_for_signal().await;
    info!(event = "daemon.server.signal", signal = signal);
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            // No SIGTERM stream; Ctrl-C still shuts the daemon down.
            warn!(event = "daemon.server.sigterm_register_failed", error = %e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

/// Serve on an already-bound listener. Split out of `run_server` so tests
/// can bind an ephemeral port and drive shutdown with their own token.
pub async fn serve(
    listener: TcpListener,
    config: DaemonConfig,
    shutdown: CancellationToken,
) -> Result<(), DaemonError> {
    let paths = TermawayPaths::resolve().unwrap_or_else(|e| {
        warn!(
            event = "daemon.server.paths_resolve_failed",
            error = %e,
            fallback = "/tmp/.termaway",
        );
        TermawayPaths::from_dir(std::path::PathBuf::from("/tmp/.termaway"))
    });

    // TLS iff both certificate and key are present; plaintext otherwise.
    let cert_dir = config.resolved_cert_dir(&paths);
    let acceptor = match tls::load_cert_pair(&cert_dir)? {
        Some((certs, key)) => {
            // Install ring crypto provider once — required by rustls 0.23.
            // try-install so tests that serve repeatedly don't panic.
            let _ = rustls::crypto::ring::default_provider().install_default();
            Some(TlsAcceptor::from(tls::build_server_config(certs, key)?))
        }
        None => None,
    };

    let local_addr = listener.local_addr()?;
    info!(
        event = "daemon.server.started",
        pid = std::process::id(),
        addr = %local_addr,
        tls = acceptor.is_some(),
        auth_required = config.password.is_some(),
        service_name = config.service_name.as_deref().unwrap_or(""),
    );

    // Channel for PTY exit notifications from reader tasks
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::unbounded_channel();

    let state = Arc::new(ServerState {
        manager: RwLock::new(SessionManager::new(config.clone(), exit_tx)),
        registry: RwLock::new(ClientRegistry::new()),
        limiter: Mutex::new(RateLimiter::new(
            Duration::from_millis(config.auth_window_ms),
            config.auth_max_attempts,
        )),
        config,
    });

    tokio::spawn(heartbeat::run_heartbeat(state.clone(), shutdown.clone()));

    loop {
        tokio::select! {
            accept = listener.accept() => match accept {
                Ok((stream, addr)) => {
                    let remote = registry::normalize_remote_addr(addr);
                    let conn_state = state.clone();
                    let conn_shutdown = shutdown.clone();
                    match &acceptor {
                        Some(acceptor) => {
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        connection::handle_connection(
                                            tls_stream,
                                            remote,
                                            conn_state,
                                            conn_shutdown,
                                        )
                                        .await;
                                    }
                                    Err(e) => {
                                        warn!(
                                            event = "daemon.server.tls_handshake_failed",
                                            addr = %remote,
                                            error = %e,
                                        );
                                    }
                                }
                            });
                        }
                        None => {
                            tokio::spawn(connection::handle_connection(
                                stream,
                                remote,
                                conn_state,
                                conn_shutdown,
                            ));
                        }
                    }
                }
                Err(e) => {
                    error!(event = "daemon.server.accept_failed", error = %e);
                    // Brief sleep to avoid a tight spin on fatal accept
                    // errors (EMFILE, ENOMEM).
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(exit_event) = exit_rx.recv() => {
                handle_session_exit(&state, exit_event).await;
            }
            _ = shutdown.cancelled() => {
                info!(event = "daemon.server.shutdown_started");
                break;
            }
        }
    }

    // Graceful shutdown: kill every session, ignoring per-session errors.
    // Connections are children of the shutdown token and tear themselves
    // down.
    {
        let mut mgr = state.manager.write().await;
        mgr.kill_all();
    }

    info!(event = "daemon.server.shutdown_completed");

    Ok(())
}

/// A PTY child ended: remove the session, tell its attached clients, and
/// refresh everyone's session list.
async fn handle_session_exit(state: &Arc<ServerState>, event: PtyExitEvent) {
    let clients = {
        let mut mgr = state.manager.write().await;
        mgr.handle_exit(&event)
    };
    let Some(clients) = clients else {
        return;
    };

    {
        let mut registry = state.registry.write().await;
        registry.clear_attachments_to(&event.session_name);
        registry.send_to_clients(
            &clients,
            &ServerFrame::Exited {
                name: event.session_name.clone(),
                exit_code: event.exit_code,
                signal: None,
            },
        );
    }

    connection::broadcast_sessions(state).await;
}
