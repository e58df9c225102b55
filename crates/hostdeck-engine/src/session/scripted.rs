//! In-memory processes for exercising sessions without an OS pty.

use super::pty::{LaunchSpec, LaunchedProcess, ProcessControl, ProcessLauncher, ProcessWaiter};
use hostdeck_core::{DeckError, DeckResult};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Exit code reported when a scripted process is terminated (128 + SIGHUP).
pub const TERMINATED_CODE: i32 = 129;

/// What a scripted process does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Echo every input chunk back; exit after `exit_after_lines` newlines.
    Echo {
        exit_after_lines: Option<usize>,
        exit_code: i32,
    },
    /// Write `total` pattern bytes in `chunk`-sized pieces, then exit 0.
    Flood { total: usize, chunk: usize },
    /// Write `banner`, leave a descendant holding the terminal open for
    /// `hold`, and exit with `exit_code`.
    Detach {
        banner: &'static str,
        hold: Duration,
        exit_code: i32,
    },
}

impl Script {
    pub fn echo_forever() -> Self {
        Script::Echo {
            exit_after_lines: None,
            exit_code: 0,
        }
    }
}

/// Byte at position `i` of a flood stream.
pub fn flood_byte(i: usize) -> u8 {
    (i % 251) as u8
}

/// Observations shared between a launcher and the test.
#[derive(Debug, Default)]
pub struct Observed {
    pub input: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub launches: Mutex<Vec<LaunchSpec>>,
    pub terminations: Mutex<usize>,
}

pub struct ScriptedLauncher {
    script: Script,
    fail: bool,
    stall_input: bool,
    refuse_first_terminate: bool,
    pub observed: Arc<Observed>,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            fail: false,
            stall_input: false,
            refuse_first_terminate: false,
            observed: Arc::default(),
        }
    }

    /// A launcher whose every launch fails like a missing executable.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Script::echo_forever())
        }
    }

    /// Writes block, like a pty whose reader stopped draining input, until
    /// the process is terminated; then they fail.
    pub fn with_stalled_input(mut self) -> Self {
        self.stall_input = true;
        self
    }

    /// The first terminate request fails, as when the signal is refused.
    pub fn with_refused_first_terminate(mut self) -> Self {
        self.refuse_first_terminate = true;
        self
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> DeckResult<LaunchedProcess> {
        if self.fail {
            return Err(DeckError::Spawn(format!("{}: not found", spec.command)));
        }
        self.observed
            .launches
            .lock()
            .unwrap()
            .push(spec.clone());

        let (in_tx, in_rx) = sync_channel::<Vec<u8>>(16);
        let (out_tx, out_rx) = sync_channel::<Vec<u8>>(4);
        let exit = Arc::new((Mutex::new(None::<i32>), Condvar::new()));
        let terminated = Arc::new(AtomicBool::new(false));

        let script = self.script.clone();
        let observed = self.observed.clone();
        let exit_slot = exit.clone();
        let term = terminated.clone();
        std::thread::spawn(move || {
            let code = run_script(script, in_rx, out_tx, &observed, &term);
            let (slot, cvar) = &*exit_slot;
            *slot.lock().unwrap() = Some(code);
            cvar.notify_all();
        });

        Ok(LaunchedProcess {
            pid: None,
            reader: Box::new(ChannelReader {
                rx: out_rx,
                pending: Vec::new(),
            }),
            writer: Box::new(ChannelWriter {
                tx: in_tx,
                stalled_until: self.stall_input.then(|| terminated.clone()),
            }),
            control: Box::new(ScriptedControl {
                terminated,
                refuse_next: AtomicBool::new(self.refuse_first_terminate),
                observed: self.observed.clone(),
            }),
            waiter: Box::new(ScriptedWaiter { exit }),
        })
    }
}

fn run_script(
    script: Script,
    input: Receiver<Vec<u8>>,
    output: SyncSender<Vec<u8>>,
    observed: &Observed,
    terminated: &AtomicBool,
) -> i32 {
    match script {
        Script::Echo {
            exit_after_lines,
            exit_code,
        } => {
            let mut lines = 0usize;
            loop {
                if terminated.load(Ordering::SeqCst) {
                    return TERMINATED_CODE;
                }
                match input.recv_timeout(Duration::from_millis(5)) {
                    Ok(chunk) => {
                        observed.input.lock().unwrap().extend_from_slice(&chunk);
                        lines += chunk.iter().filter(|&&b| b == b'\n').count();
                        if output.send(chunk).is_err() {
                            return TERMINATED_CODE;
                        }
                        if exit_after_lines.is_some_and(|n| lines >= n) {
                            return exit_code;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return exit_code,
                }
            }
        }
        Script::Flood { total, chunk } => {
            let mut sent = 0;
            while sent < total {
                if terminated.load(Ordering::SeqCst) {
                    return TERMINATED_CODE;
                }
                let end = (sent + chunk.max(1)).min(total);
                let piece: Vec<u8> = (sent..end).map(flood_byte).collect();
                if output.send(piece).is_err() {
                    return TERMINATED_CODE;
                }
                sent = end;
            }
            0
        }
        Script::Detach {
            banner,
            hold,
            exit_code,
        } => {
            if output.send(banner.as_bytes().to_vec()).is_err() {
                return TERMINATED_CODE;
            }
            std::thread::spawn(move || {
                let _terminal = output;
                std::thread::sleep(hold);
            });
            exit_code
        }
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct ChannelWriter {
    tx: SyncSender<Vec<u8>>,
    stalled_until: Option<Arc<AtomicBool>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(terminated) = &self.stalled_until {
            while !terminated.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ScriptedControl {
    terminated: Arc<AtomicBool>,
    refuse_next: AtomicBool,
    observed: Arc<Observed>,
}

impl ProcessControl for ScriptedControl {
    fn resize(&self, rows: u16, cols: u16) -> DeckResult<()> {
        self.observed.resizes.lock().unwrap().push((rows, cols));
        Ok(())
    }

    fn terminate(&self) -> DeckResult<()> {
        if self.refuse_next.swap(false, Ordering::SeqCst) {
            return Err(DeckError::Other("kill failed: operation not permitted".into()));
        }
        *self.observed.terminations.lock().unwrap() += 1;
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedWaiter {
    exit: Arc<(Mutex<Option<i32>>, Condvar)>,
}

impl ProcessWaiter for ScriptedWaiter {
    fn wait(self: Box<Self>) -> DeckResult<i32> {
        let (slot, cvar) = &*self.exit;
        let mut code = slot.lock().unwrap();
        while code.is_none() {
            code = cvar.wait(code).unwrap();
        }
        Ok(code.unwrap_or(-1))
    }
}
