use nix::errno::Errno;
use nix::unistd::Pid;

use crate::ptbox::debugger::{Arch, SyscallId};

/// Errors reported synchronously by the sandbox engine.
///
/// Policy violations are *not* errors: they are reported as events and as the
/// exit reason of the run.  Everything here is either a configuration mistake
/// by the owner or an OS-level failure.
#[derive(thiserror::Error,Debug)]
pub enum PtboxError {
    #[error("Syscall id {0} is outside the handler table")]
    InvalidSyscall(SyscallId),
    #[error("Process already spawned (pid {0})")]
    AlreadySpawned(Pid),
    #[error("Process has not been spawned")]
    NotSpawned,
    #[error("Error forking the traced process: {0}")]
    Fork(Errno),
    #[error("Error waiting for traced process {0}: {1}")]
    Wait(Pid, Errno),
    #[error("Ptrace request {0} failed for process {1}: {2}")]
    Ptrace(&'static str, Pid, Errno),
    #[error("Syscall argument index {0} out of range")]
    InvalidArgument(usize),
    #[error("Cannot debug {0:?} processes on this host")]
    UnsupportedArch(Arch),
    #[error("No debugger is available for the host architecture")]
    UnsupportedHost,
    #[error("Unknown syscall name '{0}'")]
    UnknownSyscall(String)
}

impl PtboxError {
    /// True if the error only says that the tracee vanished under us (e.g. it
    /// was SIGKILLed between two stops).  The next wait reports the termination.
    pub fn is_tracee_gone(&self) -> bool {
        matches!(self, PtboxError::Ptrace(_, _, Errno::ESRCH))
    }
}

pub type Result<T> = std::result::Result<T, PtboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracee_gone() {
        let pid = Pid::from_raw(42);
        assert!(PtboxError::Ptrace("PTRACE_GETREGS", pid, Errno::ESRCH).is_tracee_gone());
        assert!(!PtboxError::Ptrace("PTRACE_GETREGS", pid, Errno::EPERM).is_tracee_gone());
        assert!(!PtboxError::Wait(pid, Errno::ESRCH).is_tracee_gone());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(PtboxError::InvalidSyscall(600).to_string(),
                   "Syscall id 600 is outside the handler table");
        assert_eq!(PtboxError::UnknownSyscall("frobnicate".to_owned()).to_string(),
                   "Unknown syscall name 'frobnicate'");
    }
}
