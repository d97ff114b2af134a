use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use termaway_protocol::{ClientFrame, ServerFrame};

use crate::auth::{self, RateDecision};
use crate::codec::{read_line, write_frame};
use crate::errors::DaemonError;
use crate::server::ServerState;
use crate::server::registry::is_loopback_addr;
use crate::session::state::ClientId;

/// Connection-local context threaded through dispatch.
///
/// Shared state (authenticated, attached session, forward task) lives in
/// the registry so actions taken by other connections, like a kill or a
/// kick, are visible to this one immediately.
struct ConnCtx {
    client_id: ClientId,
    remote_addr: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
    cancel: CancellationToken,
}

impl ConnCtx {
    /// Queue a frame for the writer task. Returns false once the
    /// connection is gone.
    fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    fn send_error(&self, error: &DaemonError) {
        self.send(ServerFrame::Error {
            message: error.to_string(),
        });
    }
}

/// Handle one client connection for its whole lifetime.
///
/// Reads JSONL frames, dispatches them against the session manager and the
/// client registry, and tears everything down (forward task, writer task,
/// attachments, registry entry) when the transport closes, the heartbeat
/// gives up on the peer, or the daemon shuts down.
pub async fn handle_connection<S>(
    stream: S,
    remote_addr: String,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let cancel = shutdown.child_token();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let password_required = state.config.password.is_some();
    let connected_at = chrono::Utc::now().to_rfc3339();

    let client_id = {
        let mut registry = state.registry.write().await;
        registry.register(
            tx.clone(),
            remote_addr.clone(),
            connected_at,
            !password_required,
            cancel.clone(),
        )
    };

    debug!(
        event = "daemon.connection.accepted",
        client_id = client_id,
        addr = %remote_addr,
    );

    // Writer task: drains the outbound queue onto the socket. A write
    // failure cancels the whole connection.
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = write_frame(&mut write_half, &frame).await {
                            debug!(event = "daemon.connection.write_failed", error = %e);
                            writer_cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_cancel.cancelled() => break,
            }
        }
    });

    let ctx = ConnCtx {
        client_id,
        remote_addr: remote_addr.clone(),
        tx: tx.clone(),
        cancel: cancel.clone(),
    };

    ctx.send(ServerFrame::AuthRequired {
        required: password_required,
    });

    if !password_required {
        // Deferred one scheduling tick so the peer can finish its own
        // setup before seeing the event.
        let state_clone = state.clone();
        let addr = remote_addr.clone();
        tokio::spawn(async move {
            broadcast_client_event(&state_clone, true, &addr).await;
        });
    }

    loop {
        tokio::select! {
            result = read_line(&mut reader) => match result {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    dispatch_line(&line, &ctx, &state).await;
                }
                Ok(None) => {
                    debug!(event = "daemon.connection.closed_by_peer", client_id = client_id);
                    break;
                }
                Err(e) => {
                    warn!(
                        event = "daemon.connection.read_error",
                        client_id = client_id,
                        error = %e,
                    );
                    break;
                }
            },
            _ = cancel.cancelled() => {
                debug!(event = "daemon.connection.cancelled", client_id = client_id);
                break;
            }
        }
    }

    // Teardown. Registry first so the disconnect event's clientCount is
    // the count after this connection is gone.
    cancel.cancel();

    let removed = {
        let mut registry = state.registry.write().await;
        registry.remove(client_id)
    };
    if let Some(mut handle) = removed {
        if let Some(forward) = handle.forward.take() {
            forward.abort();
        }
        {
            let mut mgr = state.manager.write().await;
            mgr.detach_all(client_id);
        }
        if handle.authenticated {
            broadcast_client_event(&state, false, &remote_addr).await;
        }
    }

    let _ = writer_task.await;

    debug!(event = "daemon.connection.finished", client_id = client_id);
}

/// Parse one line and route it through the per-connection FSM.
async fn dispatch_line(line: &str, ctx: &ConnCtx, state: &Arc<ServerState>) {
    let frame = match ClientFrame::from_line(line) {
        Ok(frame) => frame,
        Err(e) => {
            ctx.send(ServerFrame::Error {
                message: e.to_string(),
            });
            return;
        }
    };

    // Liveness responses are valid in any state.
    if matches!(frame, ClientFrame::Pong) {
        let mut registry = state.registry.write().await;
        registry.set_alive(ctx.client_id, true);
        return;
    }

    let authenticated = {
        let registry = state.registry.read().await;
        registry.is_authenticated(ctx.client_id)
    };

    match (frame, authenticated) {
        (ClientFrame::Auth { password }, false) => handle_auth(&password, ctx, state).await,
        (ClientFrame::Auth { .. }, true) => {
            ctx.send(ServerFrame::Error {
                message: "Already authenticated".to_string(),
            });
        }
        (_, false) => {
            ctx.send(ServerFrame::Error {
                message: "Authentication required".to_string(),
            });
        }
        (frame, true) => dispatch_authenticated(frame, ctx, state).await,
    }
}

/// The auth gate: rate limit first, timing-safe compare second.
async fn handle_auth(password: &str, ctx: &ConnCtx, state: &Arc<ServerState>) {
    let Some(expected) = state.config.password.as_deref() else {
        // No password configured means connections authenticate on accept,
        // so this arm is unreachable; answer success anyway.
        ctx.send(ServerFrame::AuthSuccess);
        return;
    };

    let decision = {
        let mut limiter = match state.limiter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        limiter.begin_attempt(&ctx.remote_addr)
    };

    if let RateDecision::Limited { retry_after_secs } = decision {
        warn!(
            event = "daemon.auth.rate_limited",
            client_id = ctx.client_id,
            addr = %ctx.remote_addr,
        );
        ctx.send(ServerFrame::AuthFailed {
            message: format!("Too many attempts. Try again in {}s", retry_after_secs),
        });
        return;
    }

    if auth::verify_password(expected, password) {
        {
            let mut limiter = match state.limiter.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            limiter.clear(&ctx.remote_addr);
        }
        {
            let mut registry = state.registry.write().await;
            registry.set_authenticated(ctx.client_id);
        }
        info!(
            event = "daemon.auth.succeeded",
            client_id = ctx.client_id,
            addr = %ctx.remote_addr,
        );
        ctx.send(ServerFrame::AuthSuccess);
        broadcast_client_event(state, true, &ctx.remote_addr).await;
    } else {
        {
            let mut limiter = match state.limiter.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            limiter.record_failure(&ctx.remote_addr);
        }
        warn!(
            event = "daemon.auth.failed",
            client_id = ctx.client_id,
            addr = %ctx.remote_addr,
        );
        ctx.send(ServerFrame::AuthFailed {
            message: "Invalid password".to_string(),
        });
    }
}

/// Dispatch the full message set available to authenticated connections.
async fn dispatch_authenticated(frame: ClientFrame, ctx: &ConnCtx, state: &Arc<ServerState>) {
    match frame {
        ClientFrame::List => {
            let list = state.manager.read().await.list_entries();
            ctx.send(ServerFrame::Sessions { list });
        }

        ClientFrame::Create { name } => {
            let created = {
                let mut mgr = state.manager.write().await;
                mgr.create(&name)
            };
            match created {
                Ok(name) => {
                    ctx.send(ServerFrame::Created { name: name.clone() });
                    attach_session(ctx, state, &name).await;
                    broadcast_sessions(state).await;
                }
                Err(e) => ctx.send_error(&e),
            }
        }

        ClientFrame::Attach { name } => {
            attach_session(ctx, state, &name).await;
        }

        ClientFrame::Detach => {
            detach_current(ctx, state).await;
            ctx.send(ServerFrame::Detached);
        }

        ClientFrame::Input { data } => {
            let attached = {
                let registry = state.registry.read().await;
                registry.attached_session(ctx.client_id)
            };
            match attached {
                None => ctx.send_error(&DaemonError::NotAttached),
                Some(name) => {
                    let result = {
                        let mgr = state.manager.read().await;
                        mgr.write_input(&name, data.as_bytes())
                    };
                    if let Err(e) = result {
                        ctx.send_error(&e);
                    }
                }
            }
        }

        ClientFrame::Resize { cols, rows } => {
            // Dropped silently when not attached, non-numeric, or out of
            // range; the manager drops degenerate and cooldown cases.
            let attached = {
                let registry = state.registry.read().await;
                registry.attached_session(ctx.client_id)
            };
            let Some(name) = attached else { return };
            let (Some(cols), Some(rows)) = (cols.as_i64(), rows.as_i64()) else {
                return;
            };
            if cols < 1 || rows < 1 || cols > i64::from(u16::MAX) || rows > i64::from(u16::MAX)
            {
                return;
            }
            let result = {
                let mut mgr = state.manager.write().await;
                mgr.resize(&name, cols as u16, rows as u16, ctx.client_id)
            };
            if let Err(e) = result {
                debug!(
                    event = "daemon.connection.resize_failed",
                    session = %name,
                    error = %e,
                );
            }
        }

        ClientFrame::Kill { name } => {
            let killed = {
                let mut mgr = state.manager.write().await;
                mgr.kill(&name)
            };
            match killed {
                Ok(attached_clients) => {
                    let mut notify = attached_clients;
                    if !notify.contains(&ctx.client_id) {
                        notify.push(ctx.client_id);
                    }
                    {
                        let mut registry = state.registry.write().await;
                        registry.clear_attachments_to(&name);
                        registry
                            .send_to_clients(&notify, &ServerFrame::Killed { name: name.clone() });
                    }
                    broadcast_sessions(state).await;
                }
                Err(e) => ctx.send_error(&e),
            }
        }

        ClientFrame::Rename { old_name, new_name } => {
            let renamed = {
                let mut mgr = state.manager.write().await;
                mgr.rename(&old_name, &new_name)
            };
            match renamed {
                Ok((new_name, attached_clients)) => {
                    {
                        let mut registry = state.registry.write().await;
                        registry.rekey_attachments(&old_name, &new_name);
                        registry.send_to_clients(
                            &attached_clients,
                            &ServerFrame::Renamed {
                                old_name: old_name.clone(),
                                new_name: new_name.clone(),
                            },
                        );
                    }
                    broadcast_sessions(state).await;
                }
                Err(e) => ctx.send_error(&e),
            }
        }

        ClientFrame::ClipboardSet { content } => {
            let Some(content) = content.as_str() else {
                ctx.send_error(&DaemonError::InvalidClipboard);
                return;
            };
            let result = {
                let mut mgr = state.manager.write().await;
                mgr.set_clipboard(content.to_string())
            };
            match result {
                Ok(()) => {
                    {
                        let registry = state.registry.read().await;
                        registry.broadcast_to_authenticated_except(
                            ctx.client_id,
                            &ServerFrame::ClipboardUpdate {
                                content: content.to_string(),
                            },
                        );
                    }
                    ctx.send(ServerFrame::ClipboardSetOk);
                }
                Err(e) => ctx.send_error(&e),
            }
        }

        ClientFrame::ClipboardGet => {
            let content = {
                let mgr = state.manager.read().await;
                mgr.clipboard().to_string()
            };
            ctx.send(ServerFrame::ClipboardContent { content });
        }

        ClientFrame::ListClients => {
            let list = {
                let registry = state.registry.read().await;
                registry.list_entries()
            };
            ctx.send(ServerFrame::Clients { list });
        }

        ClientFrame::KickClient { client_id } => {
            if client_id < 0 {
                ctx.send(ServerFrame::Error {
                    message: "Client not found".to_string(),
                });
                return;
            }
            let index = client_id as usize;
            let registry = state.registry.read().await;
            match registry.client_by_index(index) {
                None => {
                    ctx.send(ServerFrame::Error {
                        message: "Client not found".to_string(),
                    });
                }
                Some(target) if target == ctx.client_id => {
                    ctx.send(ServerFrame::Error {
                        message: "Cannot kick yourself".to_string(),
                    });
                }
                Some(target) => {
                    info!(
                        event = "daemon.connection.client_kicked",
                        by = ctx.client_id,
                        target = target,
                    );
                    registry.send_to(
                        target,
                        ServerFrame::Error {
                            message: "Kicked by another client".to_string(),
                        },
                    );
                    if let Some(handle) = registry.get(target) {
                        handle.cancel.cancel();
                    }
                    ctx.send(ServerFrame::ClientKicked { client_id: index });
                }
            }
        }

        // Handled before dispatch.
        ClientFrame::Auth { .. } | ClientFrame::Pong => {}
    }
}

/// Attach this connection to `name`: leave the current session, register
/// the attachment, replay scrollback in paced slices, confirm with
/// `attached`, then start live fan-out.
async fn attach_session(ctx: &ConnCtx, state: &Arc<ServerState>, name: &str) {
    detach_current(ctx, state).await;

    let replay = {
        let mut mgr = state.manager.write().await;
        mgr.attach(name, ctx.client_id)
    };
    let replay = match replay {
        Ok(replay) => replay,
        Err(e) => {
            ctx.send_error(&e);
            return;
        }
    };

    {
        let mut registry = state.registry.write().await;
        registry.set_attached(ctx.client_id, Some(name.to_string()));
    }

    // Replay the scrollback as contiguous slices with a pacing gap so a
    // resource-constrained receiver can drain. The `attached` confirmation
    // goes out only after the last slice.
    let gap = Duration::from_millis(state.config.replay_gap_ms);
    let mut first = true;
    for slice in replay.scrollback.chunks(state.config.replay_chunk_bytes) {
        if !first {
            tokio::time::sleep(gap).await;
        }
        first = false;
        let delivered = ctx.send(ServerFrame::Output {
            data: String::from_utf8_lossy(slice).into_owned(),
        });
        if !delivered {
            // Connection closed mid-replay; remaining slices are dropped.
            return;
        }
    }

    ctx.send(ServerFrame::Attached {
        name: name.to_string(),
    });

    let forward = spawn_forward_task(replay.live, ctx.tx.clone(), ctx.cancel.clone());
    {
        let mut registry = state.registry.write().await;
        match registry.get_mut(ctx.client_id) {
            Some(handle) => {
                if let Some(previous) = handle.forward.replace(forward) {
                    previous.abort();
                }
            }
            // Connection already removed; stop the orphaned task.
            None => forward.abort(),
        }
    }
}

/// Detach from the current session, if any. Stops the forward task and
/// recomputes the session's arbitrated size.
async fn detach_current(ctx: &ConnCtx, state: &Arc<ServerState>) {
    let attached = {
        let mut registry = state.registry.write().await;
        let Some(handle) = registry.get_mut(ctx.client_id) else {
            return;
        };
        if let Some(forward) = handle.forward.take() {
            forward.abort();
        }
        handle.attached.take()
    };
    if let Some(name) = attached {
        let mut mgr = state.manager.write().await;
        mgr.detach(&name, ctx.client_id);
    }
}

/// Forward live PTY output to this connection until it detaches, the
/// session ends, or the connection closes.
fn spawn_forward_task(
    mut rx: broadcast::Receiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<ServerFrame>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Ok(data) => {
                        let frame = ServerFrame::Output {
                            data: String::from_utf8_lossy(&data).into_owned(),
                        };
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            event = "daemon.connection.output_lagged",
                            skipped = skipped,
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    })
}

/// Broadcast a session-list snapshot to every authenticated connection.
pub(crate) async fn broadcast_sessions(state: &Arc<ServerState>) {
    let list = {
        let mgr = state.manager.read().await;
        mgr.list_entries()
    };
    let registry = state.registry.read().await;
    registry.broadcast_to_authenticated(&ServerFrame::Sessions { list });
}

/// Broadcast a client-connected/disconnected event.
///
/// `clientCount` is the authenticated count after the event was applied.
/// Loopback peers are counted but not announced (a local companion
/// process is not interesting to the wider audience).
pub(crate) async fn broadcast_client_event(
    state: &Arc<ServerState>,
    connected: bool,
    remote_addr: &str,
) {
    let registry = state.registry.read().await;
    if is_loopback_addr(remote_addr) {
        return;
    }
    let client_count = registry.authenticated_count();
    let timestamp = chrono::Utc::now().to_rfc3339();
    let frame = if connected {
        ServerFrame::ClientConnected {
            client_ip: remote_addr.to_string(),
            client_count,
            timestamp,
        }
    } else {
        ServerFrame::ClientDisconnected {
            client_ip: remote_addr.to_string(),
            client_count,
            timestamp,
        }
    };
    registry.broadcast_to_authenticated(&frame);
}
