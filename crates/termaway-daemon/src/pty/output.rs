use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Mutex};

use portable_pty::Child;
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Bounded ring of output chunks for scrollback replay on attach.
///
/// Chunks are kept exactly as produced by the PTY reader and are never
/// split: when an append pushes the byte total over `max_bytes`, whole
/// chunks are dropped from the head until the total fits again.
pub struct ScrollbackBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_bytes: usize,
}

impl ScrollbackBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Append one chunk, evicting oldest chunks while over the cap.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.total_bytes += data.len();
        self.chunks.push_back(data.to_vec());
        while self.total_bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(dropped) => self.total_bytes -= dropped.len(),
                None => break,
            }
        }
    }

    /// All buffered bytes, concatenated in append order.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Current total byte length.
    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }
}

/// Notification that a PTY child has ended (EOF on the master or read error).
///
/// `pid` is the child pid at spawn time; the manager ignores events whose
/// pid no longer matches the registered session, so a late event from a
/// killed session cannot tear down a newer session reusing the name.
pub struct PtyExitEvent {
    pub session_name: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

/// Spawn the blocking task that pumps PTY output into the scrollback ring
/// and the live broadcast channel, then reaps the child on EOF.
///
/// Push and send happen under the scrollback lock: an attaching client
/// snapshots the ring and subscribes under the same lock, so every chunk
/// lands in exactly one of snapshot or live stream, never both.
pub fn spawn_pty_reader(
    session_name: String,
    pid: Option<u32>,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    output_tx: broadcast::Sender<Vec<u8>>,
    scrollback: Arc<Mutex<ScrollbackBuffer>>,
    exit_tx: tokio::sync::mpsc::UnboundedSender<PtyExitEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "daemon.pty.reader_eof", session = %session_name);
                    break;
                }
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    match scrollback.lock() {
                        Ok(mut sb) => {
                            sb.push(&data);
                            // No receivers just means no one is attached
                            let _ = output_tx.send(data);
                        }
                        Err(poisoned) => {
                            poisoned.into_inner().push(&data);
                            let _ = output_tx.send(data);
                        }
                    }
                }
                Err(e) => {
                    error!(
                        event = "daemon.pty.reader_error",
                        session = %session_name,
                        error = %e,
                    );
                    break;
                }
            }
        }

        let exit_code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                error!(
                    event = "daemon.pty.wait_failed",
                    session = %session_name,
                    error = %e,
                );
                None
            }
        };

        let _ = exit_tx.send(PtyExitEvent {
            session_name,
            pid,
            exit_code,
        });
    })
}
