//! PTY process management.
//!
//! Wraps `portable-pty` to spawn an interactive shell on a pseudo-terminal
//! and bridge its output into an async channel. Reads happen on blocking
//! tasks since the PTY file descriptors are synchronous.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum TermError {
    #[error("Failed to spawn shell: {0}")]
    Spawn(String),

    #[error("Failed to write to terminal: {0}")]
    Write(String),

    #[error("Failed to resize terminal: {0}")]
    Resize(String),

    #[error("Failed to kill process: {0}")]
    Kill(String),
}

/// Event emitted by a running PTY process.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    /// Chunk of terminal output, lossily decoded as UTF-8.
    Output(String),
    /// The child process exited. `signal` is set only when the process was
    /// killed by this server rather than exiting on its own.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}

/// Anything that can receive synthetic keystrokes.
///
/// The venv orchestrator drives a shell through this seam, which also lets
/// tests substitute a recording fake for a real PTY.
pub trait ShellInput: Send + Sync {
    fn write_input(&self, data: &str) -> Result<(), TermError>;
}

/// A shell process attached to a pseudo-terminal.
pub struct PtyProcess {
    writer: Mutex<Box<dyn std::io::Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    killed: Arc<AtomicBool>,
    pid: Option<u32>,
}

const READ_BUF_SIZE: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 256;

impl PtyProcess {
    /// Spawn `shell` with `args` in `cwd` on a new PTY of the given size.
    ///
    /// Returns the process handle plus the receiving end of its event
    /// stream. The stream yields output chunks followed by exactly one
    /// `Exit` event when the child terminates.
    pub fn spawn(
        shell: &str,
        args: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::Receiver<PtyEvent>), TermError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: rows.max(2),
                cols: cols.max(2),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::Spawn(e.to_string()))?;
        // Close the slave side in this process so the reader sees EOF when
        // the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermError::Spawn(e.to_string()))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TermError::Spawn(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // Output pump. Runs until EOF or read error.
        let output_tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        if output_tx.blocking_send(PtyEvent::Output(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("pty read ended: {e}");
                        break;
                    }
                }
            }
        });

        let killed = Arc::new(AtomicBool::new(false));
        let process = Self {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            killed: killed.clone(),
            pid,
        };

        // Exit watcher. Sends the single Exit event for this process.
        let exit_tx = tx;
        let killed_flag = killed;
        tokio::task::spawn_blocking(move || {
            let (code, killed) = match child.wait() {
                Ok(status) => (
                    Some(status.exit_code() as i32),
                    killed_flag.load(Ordering::SeqCst),
                ),
                Err(e) => {
                    warn!("pty wait failed: {e}");
                    (None, killed_flag.load(Ordering::SeqCst))
                }
            };
            let signal = killed.then(|| "SIGKILL".to_string());
            let _ = exit_tx.blocking_send(PtyEvent::Exit { code, signal });
        });

        debug!("spawned {shell} (pid {pid:?}) in {}", cwd.display());
        Ok((process, rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resize the terminal. Dimensions are clamped to a 2x2 minimum.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TermError> {
        self.master
            .lock()
            .expect("pty master lock poisoned")
            .resize(PtySize {
                rows: rows.max(2),
                cols: cols.max(2),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermError::Resize(e.to_string()))
    }

    /// Kill the child process. Idempotent: later calls are no-ops.
    pub fn kill(&self) -> Result<(), TermError> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.killer
            .lock()
            .expect("pty killer lock poisoned")
            .kill()
            .map_err(|e| TermError::Kill(e.to_string()))
    }
}

impl ShellInput for PtyProcess {
    fn write_input(&self, data: &str) -> Result<(), TermError> {
        let mut writer = self.writer.lock().expect("pty writer lock poisoned");
        writer
            .write_all(data.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| TermError::Write(e.to_string()))
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            debug!("kill on drop failed: {e}");
        }
    }
}
