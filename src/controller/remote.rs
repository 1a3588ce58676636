//! Opaque connection launcher boundary. SSH/WSL connection management is
//! out of scope for this core (`SPEC_FULL.md` §1); the controller only
//! needs something that can say whether a named connection is reachable and
//! spawn a PTY-attached process through it.

use std::io;

use super::pty::{PtyHandle, ShellCommand};

/// A "remote process launcher", opaque to the controller beyond this
/// contract. The in-process `LocalLauncher` is the only implementation this
/// crate ships; SSH/WSL launchers are supplied by the caller.
pub trait RemoteLauncher: Send + Sync {
    fn is_local(&self) -> bool;
    /// Cheap reachability probe, used to fail fast before spawning.
    fn reachable(&self) -> bool;
    fn launch(&self, cmd: &ShellCommand) -> io::Result<PtyHandle>;
}

/// Spawns directly on the local machine.
pub struct LocalLauncher;

impl RemoteLauncher for LocalLauncher {
    fn is_local(&self) -> bool {
        true
    }

    fn reachable(&self) -> bool {
        true
    }

    fn launch(&self, cmd: &ShellCommand) -> io::Result<PtyHandle> {
        PtyHandle::spawn(cmd)
    }
}
