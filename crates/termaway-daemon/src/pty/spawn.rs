use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info};

use crate::errors::DaemonError;

/// Handle to the master side of a live PTY.
///
/// The child handle and the output reader are handed to the background
/// reader task at spawn time; this handle keeps what the session manager
/// needs afterwards: stdin writes, resizes, and SIGTERM by pid.
pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Writer to PTY stdin. Wrapped in Arc<Mutex<>> because take_writer()
    /// can only be called once, but input arrives from any attached client.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child_pid: Option<u32>,
}

/// Everything produced by spawning the login shell. The caller keeps
/// `pty` and moves `child` + `reader` into the PTY reader task.
pub struct SpawnedShell {
    pub pty: PtyHandle,
    pub child: Box<dyn Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
}

/// Spawn the host user's login shell in a fresh PTY.
///
/// The shell comes from `$SHELL` (fallback `/bin/sh`) and is invoked with
/// `-l`. The child inherits the daemon's environment (locale included) with
/// `TERM`/`COLORTERM` set for full-color terminals and `PROMPT_EOL_MARK`
/// cleared so zsh does not emit its partial-line marker into the stream.
pub fn spawn_login_shell(cols: u16, rows: u16) -> Result<SpawnedShell, DaemonError> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());

    let pty_system = native_pty_system();
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };

    let pair = pty_system
        .openpty(size)
        .map_err(|e| DaemonError::Pty(format!("openpty: {}", e)))?;

    let mut cmd = CommandBuilder::new(&shell);
    cmd.arg("-l");
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd.env("PROMPT_EOL_MARK", "");

    info!(
        event = "daemon.pty.spawn_started",
        shell = %shell,
        cols = cols,
        rows = rows,
    );

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| DaemonError::Spawn(e.to_string()))?;

    let child_pid = child.process_id();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| DaemonError::Pty(format!("clone reader: {}", e)))?;

    // Take the writer once (portable-pty only allows one take_writer call)
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| DaemonError::Pty(format!("take writer: {}", e)))?;

    info!(
        event = "daemon.pty.spawn_completed",
        shell = %shell,
        pid = ?child_pid,
    );

    Ok(SpawnedShell {
        pty: PtyHandle {
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            child_pid,
        },
        child,
        reader,
    })
}

impl PtyHandle {
    /// Write bytes to PTY stdin.
    ///
    /// A write or flush failure means the PTY is gone (child exited and the
    /// slave side closed), reported as `Disconnected`.
    pub fn write(&self, data: &[u8]) -> Result<(), DaemonError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| DaemonError::Pty(format!("lock writer: {}", e)))?;
        writer
            .write_all(data)
            .map_err(|e| DaemonError::Disconnected(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| DaemonError::Disconnected(e.to_string()))?;
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), DaemonError> {
        self.master
            .lock()
            .map_err(|e| DaemonError::Pty(format!("lock master: {}", e)))?
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DaemonError::Pty(format!("resize: {}", e)))?;
        debug!(event = "daemon.pty.resize_applied", cols = cols, rows = rows,);
        Ok(())
    }

    /// Child process ID, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Send SIGTERM to the child process, followed by the hangup a closing
    /// terminal would deliver. Interactive shells ignore SIGTERM; SIGHUP
    /// ends them.
    ///
    /// The reader task observes the resulting EOF and reaps the child, so
    /// no wait happens here.
    pub fn terminate(&self) -> Result<(), DaemonError> {
        let Some(pid) = self.child_pid else {
            return Err(DaemonError::Pty("no child pid".to_string()));
        };
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM)
            .map_err(|e| DaemonError::Pty(format!("SIGTERM pid {}: {}", pid, e)))?;
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGHUP);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_login_shell_has_pid() {
        let spawned = spawn_login_shell(80, 24).unwrap();
        assert!(spawned.pty.pid().is_some());
        spawned.pty.terminate().unwrap();
    }

    #[test]
    fn test_write_and_read_echo() {
        let mut spawned = spawn_login_shell(80, 24).unwrap();
        spawned.pty.write(b"echo pty-roundtrip\n").unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        // The shell needs a moment to start; poll reads until the echoed
        // output shows up or we give up.
        for _ in 0..50 {
            match spawned.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains("pty-roundtrip") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(
            String::from_utf8_lossy(&collected).contains("pty-roundtrip"),
            "expected echoed output, got: {:?}",
            String::from_utf8_lossy(&collected)
        );
        spawned.pty.terminate().unwrap();
    }

    #[test]
    fn test_resize_succeeds() {
        let spawned = spawn_login_shell(80, 24).unwrap();
        spawned.pty.resize(120, 40).unwrap();
        spawned.pty.terminate().unwrap();
    }

    #[test]
    fn test_terminate_ends_child() {
        let mut spawned = spawn_login_shell(80, 24).unwrap();
        spawned.pty.terminate().unwrap();
        let status = spawned.child.wait().unwrap();
        // Shell was SIGTERMed; all that matters is that wait() returns.
        let _ = status.exit_code();
    }
}
