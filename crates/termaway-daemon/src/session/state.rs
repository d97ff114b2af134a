use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::error;

use termaway_protocol::SessionEntry;

use crate::pty::output::ScrollbackBuffer;
use crate::pty::spawn::PtyHandle;

/// Unique identifier for a connected client.
pub type ClientId = u64;

/// Initial PTY dimensions before any client has reported a size.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Detailed session introspection, as returned by `SessionManager::detail`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub name: String,
    pub client_count: usize,
    pub created_at: String,
    pub scrollback_length: usize,
    pub is_connected: bool,
}

/// A named PTY session: the unit of persistence across client reconnects.
///
/// Owns the PTY handle, the attached-client set, the per-client desired
/// sizes for resize arbitration, and the scrollback ring (shared with the
/// blocking PTY reader task).
pub struct Session {
    name: String,
    created_at: String,
    pty: PtyHandle,
    clients: HashSet<ClientId>,
    /// Desired size per attached client. Entries are wiped in the single
    /// detach path; the effective PTY size is the element-wise minimum.
    client_sizes: HashMap<ClientId, (u16, u16)>,
    last_cols: u16,
    last_rows: u16,
    last_resize_at: Option<Instant>,
    scrollback: Arc<Mutex<ScrollbackBuffer>>,
    output_tx: broadcast::Sender<Vec<u8>>,
}

impl Session {
    pub fn new(
        name: String,
        created_at: String,
        pty: PtyHandle,
        scrollback: Arc<Mutex<ScrollbackBuffer>>,
        output_tx: broadcast::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            name,
            created_at,
            pty,
            clients: HashSet::new(),
            client_sizes: HashMap::new(),
            last_cols: DEFAULT_COLS,
            last_rows: DEFAULT_ROWS,
            last_resize_at: None,
            scrollback,
            output_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-key the session under a new name (rename).
    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    // --- Client tracking ---

    pub fn attach_client(&mut self, client_id: ClientId) {
        self.clients.insert(client_id);
    }

    /// Detach a client, dropping its size contribution. Returns whether the
    /// client was attached.
    pub fn detach_client(&mut self, client_id: ClientId) -> bool {
        self.client_sizes.remove(&client_id);
        self.clients.remove(&client_id)
    }

    pub fn is_attached(&self, client_id: ClientId) -> bool {
        self.clients.contains(&client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn attached_clients(&self) -> Vec<ClientId> {
        self.clients.iter().copied().collect()
    }

    // --- Resize arbitration ---

    pub fn record_client_size(&mut self, client_id: ClientId, cols: u16, rows: u16) {
        self.client_sizes.insert(client_id, (cols, rows));
    }

    /// Element-wise minimum of all recorded client sizes, so every viewer
    /// sees a terminal that fits. `None` when no client has reported one.
    pub fn effective_size(&self) -> Option<(u16, u16)> {
        self.client_sizes
            .values()
            .copied()
            .reduce(|a, b| (a.0.min(b.0), a.1.min(b.1)))
    }

    /// The size most recently applied to the PTY.
    pub fn applied_size(&self) -> (u16, u16) {
        (self.last_cols, self.last_rows)
    }

    pub fn last_resize_at(&self) -> Option<Instant> {
        self.last_resize_at
    }

    /// Record that `cols`×`rows` was just applied to the PTY.
    pub fn set_applied_size(&mut self, cols: u16, rows: u16) {
        self.last_cols = cols;
        self.last_rows = rows;
        self.last_resize_at = Some(Instant::now());
    }

    // --- Output ---

    /// Subscribe to live output and snapshot the scrollback atomically.
    ///
    /// Both happen under the scrollback lock, which the PTY reader also
    /// holds across its push+send pair: every chunk is seen exactly once,
    /// either in the snapshot or on the live receiver.
    pub fn subscribe_and_snapshot(&self) -> (broadcast::Receiver<Vec<u8>>, Vec<u8>) {
        match self.scrollback.lock() {
            Ok(sb) => (self.output_tx.subscribe(), sb.contents()),
            Err(poisoned) => {
                error!(
                    event = "daemon.session.scrollback_lock_poisoned",
                    session = %self.name,
                );
                (self.output_tx.subscribe(), poisoned.into_inner().contents())
            }
        }
    }

    pub fn scrollback_len(&self) -> usize {
        match self.scrollback.lock() {
            Ok(sb) => sb.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    // --- Wire conversions ---

    pub fn to_entry(&self) -> SessionEntry {
        SessionEntry {
            name: self.name.clone(),
            client_count: self.client_count(),
            created_at: self.created_at.clone(),
            is_connected: !self.clients.is_empty(),
        }
    }

    pub fn to_detail(&self) -> SessionDetail {
        SessionDetail {
            name: self.name.clone(),
            client_count: self.client_count(),
            created_at: self.created_at.clone(),
            scrollback_length: self.scrollback_len(),
            is_connected: !self.clients.is_empty(),
        }
    }
}
