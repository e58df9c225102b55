//! Shell sessions: pty launching, per-session lifecycle, and the registry.

pub mod manager;
pub mod pty;
#[cfg(test)]
pub(crate) mod scripted;
pub mod terminal;

pub use manager::{OpenRequest, SessionDefaults, SessionRegistry};
pub use pty::{default_shell, LaunchSpec, ProcessLauncher, PtyLauncher};
pub use terminal::{OutputStream, Session};
