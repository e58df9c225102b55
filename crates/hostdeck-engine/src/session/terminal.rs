//! One interactive shell session: its process, byte channel and lifecycle.
//!
//! Output is read on a dedicated thread and handed to [`Session::pump`],
//! which forwards it to the bridge in production order and finishes with
//! exactly one `SessionExited` event. A second thread waits on the process
//! itself, so an exit is noticed even while a detached descendant keeps the
//! terminal open.

use super::pty::{LaunchSpec, LaunchedProcess, ProcessControl, ProcessLauncher, ProcessWaiter};
use crate::bridge::OutboundSender;
use hostdeck_core::{
    DeckError, DeckResult, ExitStatus, Outbound, SessionId, SessionInfo, SessionState,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Size of one read from the pty.
const READ_CHUNK: usize = 8 * 1024;

/// Chunks buffered between the reader thread and the pump.
const OUTPUT_BUFFER_CHUNKS: usize = 64;

/// Signal reported for sessions ended by `close`.
const CLOSE_SIGNAL: &str = "SIGHUP";

/// After the process exits, how long the pump waits for each further chunk.
const EXIT_IDLE_GRACE: Duration = Duration::from_millis(100);

/// Total time the pump spends waiting for output after the process exits.
const EXIT_DRAIN_BUDGET: Duration = Duration::from_secs(1);

type ExitReceiver = oneshot::Receiver<DeckResult<i32>>;

/// Lazily produced output of one session.
///
/// Yields raw chunks in the order the process wrote them and ends when the
/// process closes its side of the terminal.
pub struct OutputStream {
    chunks: mpsc::Receiver<Vec<u8>>,
    exit: ExitReceiver,
}

impl OutputStream {
    /// Next chunk, or `None` once the process's output has ended.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.chunks.recv().await
    }
}

/// Mutable terminal state guarded by the per-session lock.
struct Terminal {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    rows: u16,
    cols: u16,
}

/// A running shell session.
pub struct Session {
    id: SessionId,
    shell: String,
    cwd: Option<PathBuf>,
    pid: Option<u32>,
    created_at: Instant,
    /// Serializes writes and resizes on this session.
    terminal: tokio::sync::Mutex<Terminal>,
    control: Box<dyn ProcessControl>,
    state: Mutex<SessionState>,
    /// Set by the waiter thread once the process has been reaped.
    process_exited: Arc<AtomicBool>,
    /// Serializes termination attempts.
    close_guard: Mutex<()>,
    /// Set once a terminate request has been delivered to the process.
    terminated: AtomicBool,
    /// Flipped once `close` has terminated the process; observed by the pump.
    closing: watch::Sender<bool>,
    /// Held by the pump while delivering a chunk, and by `close` to wait
    /// out any delivery in flight.
    output_gate: tokio::sync::Mutex<()>,
}

impl Session {
    /// Spawn the process described by `spec` and return the session plus
    /// its output stream.
    pub fn open(
        id: SessionId,
        launcher: &dyn ProcessLauncher,
        spec: &LaunchSpec,
    ) -> DeckResult<(Arc<Self>, OutputStream)> {
        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                return Err(DeckError::Spawn(format!(
                    "working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }

        let LaunchedProcess {
            pid,
            reader,
            writer,
            control,
            waiter,
        } = launcher.launch(spec)?;

        let (chunk_tx, chunk_rx) = mpsc::channel(OUTPUT_BUFFER_CHUNKS);
        let process_exited = Arc::new(AtomicBool::new(false));
        let watchers = spawn_reader(id, reader, chunk_tx)
            .and_then(|()| spawn_waiter(id, waiter, process_exited.clone()));
        let exit = match watchers {
            Ok(exit) => exit,
            Err(e) => {
                // Nobody would ever reap it.
                if let Err(kill) = control.terminate() {
                    warn!(session_id = %id, error = %kill, "could not stop orphaned process");
                }
                return Err(e);
            }
        };

        let (closing, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            shell: spec.command.clone(),
            cwd: spec.cwd.clone(),
            pid,
            created_at: Instant::now(),
            terminal: tokio::sync::Mutex::new(Terminal {
                writer: Arc::new(Mutex::new(writer)),
                rows: spec.rows,
                cols: spec.cols,
            }),
            control,
            state: Mutex::new(SessionState::Starting),
            process_exited,
            close_guard: Mutex::new(()),
            terminated: AtomicBool::new(false),
            closing,
            output_gate: tokio::sync::Mutex::new(()),
        });
        session.set_state(SessionState::Running);
        info!(session_id = %id, pid = session.pid, shell = %session.shell, "session opened");

        Ok((
            session,
            OutputStream {
                chunks: chunk_rx,
                exit,
            },
        ))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn cwd(&self) -> Option<&PathBuf> {
        self.cwd.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// True once the process is gone, even if its exit event is still
    /// being delivered.
    pub fn has_exited(&self) -> bool {
        self.process_exited.load(Ordering::Acquire) || self.state().is_terminal()
    }

    /// Current terminal dimensions as `(rows, cols)`.
    pub async fn size(&self) -> (u16, u16) {
        let terminal = self.terminal.lock().await;
        (terminal.rows, terminal.cols)
    }

    pub async fn info(&self) -> SessionInfo {
        let (rows, cols) = self.size().await;
        SessionInfo {
            id: self.id,
            shell: self.shell.clone(),
            cwd: self
                .cwd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            rows,
            cols,
            state: self.state(),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Forward raw bytes to the process's input.
    pub async fn write(&self, bytes: Vec<u8>) -> DeckResult<()> {
        let terminal = self.terminal.lock().await;
        self.ensure_running()?;

        let len = bytes.len();
        let writer = terminal.writer.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&bytes)?;
            writer.flush()
        })
        .await
        .map_err(|e| DeckError::Other(format!("join error: {e}")))?;
        drop(terminal);

        match result {
            Ok(()) => {
                trace!(session_id = %self.id, len, "input written");
                Ok(())
            }
            // The process went away underneath the write.
            Err(_) if self.is_closing() || self.has_exited() => {
                Err(DeckError::SessionClosed(self.id))
            }
            Err(e) => Err(DeckError::Io(e)),
        }
    }

    /// Propagate a window-size change. Identical dimensions are a no-op.
    pub async fn resize(&self, rows: u16, cols: u16) -> DeckResult<()> {
        if rows == 0 || cols == 0 {
            return Err(DeckError::Other(format!("invalid terminal size {rows}x{cols}")));
        }
        let mut terminal = self.terminal.lock().await;
        self.ensure_running()?;
        if (terminal.rows, terminal.cols) == (rows, cols) {
            trace!(session_id = %self.id, rows, cols, "resize unchanged");
            return Ok(());
        }
        self.control.resize(rows, cols)?;
        terminal.rows = rows;
        terminal.cols = cols;
        debug!(session_id = %self.id, rows, cols, "session resized");
        Ok(())
    }

    /// Terminate the process.
    ///
    /// Once this returns no further `SessionOutput` for this session is
    /// produced; the final `SessionExited` still follows. Idempotent. If the
    /// process cannot be signalled the session keeps running and a later
    /// call tries again.
    pub async fn close(&self) -> DeckResult<()> {
        self.request_termination()?;
        // Wait out a chunk that is mid-delivery.
        let _gate = self.output_gate.lock().await;
        Ok(())
    }

    fn request_termination(&self) -> DeckResult<()> {
        let _serialized = self.close_guard.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closing() {
            return Ok(());
        }
        if !self.has_exited() {
            info!(session_id = %self.id, "closing session");
            match self.control.terminate() {
                Ok(()) => self.terminated.store(true, Ordering::Release),
                // The process may have exited on its own in the meantime.
                Err(_) if self.has_exited() => {}
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "terminate failed");
                    return Err(e);
                }
            }
        }
        self.closing.send_replace(true);
        Ok(())
    }

    /// Drive the output stream to completion: forward every chunk, then
    /// emit the single terminal event. Returns the exit status.
    pub async fn pump(&self, stream: OutputStream, outbound: &OutboundSender) -> ExitStatus {
        let OutputStream {
            mut chunks,
            mut exit,
        } = stream;
        let mut closing = self.closing.subscribe();
        let mut exit_code: Option<DeckResult<i32>> = None;
        let mut drain_budget = EXIT_DRAIN_BUDGET;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = closing.wait_for(|c| *c) => break,
                code = &mut exit, if exit_code.is_none() => {
                    debug!(session_id = %self.id, "process exited, draining output");
                    exit_code = Some(code.unwrap_or_else(|_| Err(waiter_lost())));
                    continue;
                }
                chunk = next_chunk(&mut chunks, exit_code.is_some(), &mut drain_budget) => {
                    match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    }
                }
            };

            let _gate = self.output_gate.lock().await;
            if *closing.borrow() {
                break;
            }
            let event = Outbound::SessionOutput {
                id: self.id,
                bytes: chunk,
            };
            let delivered = tokio::select! {
                biased;
                _ = closing.wait_for(|c| *c) => false,
                sent = outbound.send(event) => sent.is_ok(),
            };
            if !delivered {
                break;
            }
        }

        // Dropping the receiver unblocks the reader thread.
        drop(chunks);
        let code = match exit_code {
            Some(code) => code,
            None => exit.await.unwrap_or_else(|_| Err(waiter_lost())),
        };

        let killed = self.terminated.load(Ordering::Acquire);
        let status = match code {
            Ok(code) if killed && code != 0 => ExitStatus::Killed {
                signal: CLOSE_SIGNAL.to_string(),
            },
            Ok(code) => ExitStatus::Exited { code },
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "could not collect exit status");
                if killed {
                    ExitStatus::Killed {
                        signal: CLOSE_SIGNAL.to_string(),
                    }
                } else {
                    ExitStatus::Exited { code: -1 }
                }
            }
        };

        self.set_state(status.clone().into());
        info!(session_id = %self.id, status = ?status, "session exited");

        let exited = Outbound::SessionExited {
            id: self.id,
            status: status.clone(),
        };
        if outbound.send(exited).await.is_err() {
            debug!(session_id = %self.id, "bridge closed before exit could be delivered");
        }
        status
    }

    fn ensure_running(&self) -> DeckResult<()> {
        if self.is_closing() || self.has_exited() {
            return Err(DeckError::SessionClosed(self.id));
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
    }
}

fn waiter_lost() -> DeckError {
    DeckError::Other("exit watcher stopped without a status".into())
}

/// Next output chunk. Once the process has exited only output that shows
/// up promptly is taken: a detached descendant can hold the terminal open
/// long after the shell is gone.
async fn next_chunk(
    chunks: &mut mpsc::Receiver<Vec<u8>>,
    exited: bool,
    budget: &mut Duration,
) -> Option<Vec<u8>> {
    if !exited {
        return chunks.recv().await;
    }
    if budget.is_zero() {
        return None;
    }
    let started = tokio::time::Instant::now();
    let chunk = tokio::time::timeout(EXIT_IDLE_GRACE.min(*budget), chunks.recv())
        .await
        .ok()
        .flatten();
    *budget = budget.saturating_sub(started.elapsed());
    chunk
}

/// Read the pty on a dedicated thread; reads block until the process
/// writes or every holder of the terminal has closed it.
fn spawn_reader(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    chunks: mpsc::Sender<Vec<u8>>,
) -> DeckResult<()> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{id}"))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if chunks.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO is how Linux reports that the slave side closed.
                    Err(e) => {
                        trace!(session_id = %id, error = %e, "pty read ended");
                        break;
                    }
                }
            }
            trace!(session_id = %id, "reader finished");
        })
        .map(|_| ())
        .map_err(|e| DeckError::Spawn(format!("failed to start reader thread: {e}")))
}

/// Wait for the process on a dedicated thread and hand over its exit code.
fn spawn_waiter(
    id: SessionId,
    waiter: Box<dyn ProcessWaiter>,
    exited: Arc<AtomicBool>,
) -> DeckResult<ExitReceiver> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(format!("pty-waiter-{id}"))
        .spawn(move || {
            let code = waiter.wait();
            exited.store(true, Ordering::Release);
            trace!(session_id = %id, "process reaped");
            if tx.send(code).is_err() {
                trace!(session_id = %id, "pump gone before exit was collected");
            }
        })
        .map_err(|e| DeckError::Spawn(format!("failed to start waiter thread: {e}")))?;
    Ok(rx)
}
