//! Process liveness checks.
//!
//! The engine and health monitor only need one question answered: does this
//! pid still refer to a running process? The trait keeps tests hermetic.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Trait for checking whether a process exists.
pub trait ProcessProbe: Send + Sync {
    /// Returns `true` if the process exists.
    ///
    /// A process we cannot signal but that exists (EPERM) still counts as
    /// alive.
    fn alive(&self, pid: u32) -> bool;

    /// Start-time fingerprint for a pid, when the platform exposes one.
    ///
    /// Distinguishes a recycled pid from the process that originally held
    /// an allocation. The default reports nothing.
    fn started_at(&self, pid: u32) -> Option<u64> {
        let _ = pid;
        None
    }
}

/// Production implementation using `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    // The one unsafe call in the library: kill(2) with signal 0 is the
    // standard existence check and touches no memory.
    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 performs the permission and existence checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn alive(&self, _pid: u32) -> bool {
        // No portable check; treat processes as alive so cleanup never
        // removes an allocation it cannot verify.
        true
    }

    #[cfg(target_os = "linux")]
    fn started_at(&self, pid: u32) -> Option<u64> {
        // Field 22 of /proc/<pid>/stat is the start time in clock ticks.
        // Skip past the parenthesized comm field, which may contain spaces.
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let after_comm = stat.rsplit_once(')')?.1;
        after_comm.split_whitespace().nth(19)?.parse().ok()
    }
}

/// Deterministic implementation for tests.
///
/// Every pid is alive until marked dead.
#[derive(Debug, Default)]
pub struct ScriptedProcessProbe {
    dead: Mutex<HashSet<u32>>,
}

impl ScriptedProcessProbe {
    /// Create a probe where every process is alive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a pid as dead.
    pub fn mark_dead(&self, pid: u32) {
        self.dead.lock().insert(pid);
    }

    /// Mark a pid as alive again.
    pub fn revive(&self, pid: u32) {
        self.dead.lock().remove(&pid);
    }
}

impl ProcessProbe for ScriptedProcessProbe {
    fn alive(&self, pid: u32) -> bool {
        !self.dead.lock().contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        let probe = SystemProcessProbe;
        assert!(probe.alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_start_time_is_known() {
        let probe = SystemProcessProbe;
        assert!(probe.started_at(std::process::id()).is_some());
    }

    #[test]
    fn test_scripted_probe() {
        let probe = ScriptedProcessProbe::new();
        assert!(probe.alive(4242));
        probe.mark_dead(4242);
        assert!(!probe.alive(4242));
        probe.revive(4242);
        assert!(probe.alive(4242));
    }
}
