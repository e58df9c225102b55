//! Process launching behind a pseudo-terminal.
//!
//! [`ProcessLauncher`] is the seam between sessions and the OS. The native
//! implementation uses portable-pty; tests substitute a scripted process.

use hostdeck_core::{DeckError, DeckResult};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Everything needed to start one shell.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Command line, split on whitespace.
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    pub env: BTreeMap<String, String>,
}

/// Window-size and termination control over a running process.
pub trait ProcessControl: Send + Sync {
    fn resize(&self, rows: u16, cols: u16) -> DeckResult<()>;

    /// Ask the process to terminate.
    fn terminate(&self) -> DeckResult<()>;
}

/// Blocks until the process exits and yields its exit code.
pub trait ProcessWaiter: Send {
    fn wait(self: Box<Self>) -> DeckResult<i32>;
}

/// A started process and its byte channel.
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn ProcessControl>,
    pub waiter: Box<dyn ProcessWaiter>,
}

/// Starts processes for sessions.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> DeckResult<LaunchedProcess>;
}

/// The user's configured shell.
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Launches processes attached to a native pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    term: String,
}

impl PtyLauncher {
    pub fn new(term: impl Into<String>) -> Self {
        Self { term: term.into() }
    }

    fn build_command(&self, spec: &LaunchSpec) -> DeckResult<CommandBuilder> {
        let parts: Vec<&str> = spec.command.split_whitespace().collect();
        let Some((program, args)) = parts.split_first() else {
            return Err(DeckError::Spawn("empty command".into()));
        };

        let mut builder = CommandBuilder::new(program);
        for arg in args {
            builder.arg(arg);
        }
        if let Some(cwd) = &spec.cwd {
            builder.cwd(cwd);
        }
        for (key, value) in &spec.env {
            builder.env(key, value);
        }
        if !spec.env.contains_key("TERM") {
            builder.env("TERM", &self.term);
        }
        Ok(builder)
    }
}

impl Default for PtyLauncher {
    fn default() -> Self {
        Self::new("xterm-256color")
    }
}

impl ProcessLauncher for PtyLauncher {
    fn launch(&self, spec: &LaunchSpec) -> DeckResult<LaunchedProcess> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(spec.rows, spec.cols))
            .map_err(|e| DeckError::Spawn(format!("failed to open PTY: {e}")))?;

        let cmd = self.build_command(spec)?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DeckError::Spawn(format!("{}: {e}", spec.command)))?;
        // Only the child keeps the slave side open, so reads see EOF on exit.
        drop(pair.slave);

        let pid = child.process_id();
        info!(pid, command = %spec.command, rows = spec.rows, cols = spec.cols, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DeckError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DeckError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        Ok(LaunchedProcess {
            pid,
            reader,
            writer,
            control: Box::new(PtyControl {
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
            }),
            waiter: Box::new(PtyWaiter { child }),
        })
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct PtyControl {
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl ProcessControl for PtyControl {
    fn resize(&self, rows: u16, cols: u16) -> DeckResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| DeckError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(rows, cols))
            .map_err(|e| DeckError::Other(format!("PTY resize failed: {e}")))?;
        debug!(rows, cols, "PTY resized");
        Ok(())
    }

    fn terminate(&self) -> DeckResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| DeckError::Other("child killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| DeckError::Other(format!("kill failed: {e}")))
    }
}

struct PtyWaiter {
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl ProcessWaiter for PtyWaiter {
    fn wait(mut self: Box<Self>) -> DeckResult<i32> {
        let status = self
            .child
            .wait()
            .map_err(|e| DeckError::Other(format!("wait error: {e}")))?;
        Ok(i32::try_from(status.exit_code()).unwrap_or(-1))
    }
}
