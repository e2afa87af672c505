//! Process identity and liveness.

use std::fmt;
use std::io;

/// Source of the local pid and of liveness answers for remote pids.
///
/// Channels take this as a trait object so tests can simulate crashed peers.
pub trait ProcessProvider: Send + Sync + fmt::Debug {
    fn current_pid(&self) -> u64;

    fn is_alive(&self, pid: u64) -> bool;
}

/// [`ProcessProvider`] backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsProcessProvider;

impl ProcessProvider for OsProcessProvider {
    fn current_pid(&self) -> u64 {
        u64::from(std::process::id())
    }

    fn is_alive(&self, pid: u64) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs permission and existence checks only.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        let provider = OsProcessProvider;
        let pid = provider.current_pid();
        assert!(pid > 0);
        assert!(provider.is_alive(pid));
    }

    #[test]
    fn sentinel_and_out_of_range_pids_are_dead() {
        let provider = OsProcessProvider;
        assert!(!provider.is_alive(0));
        assert!(!provider.is_alive(u64::MAX));
    }

    #[test]
    fn reaped_child_is_dead() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn child");
        let pid = u64::from(child.id());
        child.wait().expect("reap child");
        assert!(!OsProcessProvider.is_alive(pid));
    }
}
