// The monitor loop: one iteration per stop of the tracee.
//
// Each iteration waits for the tracee, charges the time it ran to the process,
// decodes the wait status into a `StopKind`, applies the policy and restarts
// the tracee.  Syscall stops come in enter/exit pairs; we tell them apart by
// toggling `in_syscall`.
//
// Nothing is policed until the tracee completes its exec.  Everything before
// that is bootstrap code from the owner's spawn closure, not the submission.
// Once the target program runs, every syscall entry is looked up in the
// handler table, and anything not explicitly allowed kills the tracee.
use std::time::Instant;

use log::{debug, info, warn};
use nix::unistd::Pid;

use crate::ptbox::debugger::SyscallId;
use crate::ptbox::error::{PtboxError, Result};
use crate::ptbox::event::{Event, ExitReason};
use crate::ptbox::handler::PolicyAction;
use crate::ptbox::kernel::Resume;
use crate::ptbox::process::{SyscallContext, TracedProcess};

/// How the tracee ended
#[derive(Debug,Clone,Copy,Eq,PartialEq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32)
}

impl Termination {
    /// The exit status, or the negated signal number if the tracee was killed
    pub fn status(&self) -> i32 {
        match self {
            Termination::Exited(code) => { *code }
            Termination::Signaled(sig) => { -*sig }
        }
    }
}

/// A wait status, decoded
#[derive(Debug,Clone,Copy,Eq,PartialEq)]
pub enum StopKind {
    SyscallEnter,
    SyscallExit,
    SignalDelivered(i32),
    /// PTRACE_EVENT_EXIT: the tracee has started exiting
    ExitNotify,
    Terminated(Termination)
}

impl StopKind {
    /// Decode a raw wait status.  `in_syscall` says whether the previous
    /// syscall-stop was an entry.
    pub fn decode(status : i32, in_syscall : bool) -> StopKind {
        if libc::WIFEXITED(status) {
            return StopKind::Terminated(Termination::Exited(libc::WEXITSTATUS(status)));
        }
        if libc::WIFSIGNALED(status) {
            return StopKind::Terminated(Termination::Signaled(libc::WTERMSIG(status)));
        }
        let sig = libc::WSTOPSIG(status);
        if sig == libc::SIGTRAP | 0x80 {
            if in_syscall { StopKind::SyscallExit } else { StopKind::SyscallEnter }
        } else if sig == libc::SIGTRAP && (status >> 16) == libc::PTRACE_EVENT_EXIT {
            StopKind::ExitNotify
        } else {
            StopKind::SignalDelivered(sig)
        }
    }
}

/// What the loop does after handling a stop
enum Next {
    Resume(Option<i32>),
    /// The tracee was killed; wait for it without restarting it
    Reap
}

impl TracedProcess {
    /// Trace the spawned process until it terminates.
    ///
    /// Returns the exit status of the tracee, or the negated number of the
    /// signal that killed it.  The last event dispatched is always `Exited`.
    pub fn monitor(&mut self) -> Result<i32> {
        let pid = self.pid.ok_or(PtboxError::NotSpawned)?;
        let mut first = true;
        let mut in_syscall = false;
        let mut exit_reason = ExitReason::Normal;
        let mut exiting_sent = false;

        let termination = loop {
            let start = Instant::now();
            let (status, usage) = self.kernel.wait(pid)?;
            self.execution_time += start.elapsed();
            self.usage = usage;

            let stop = StopKind::decode(status, in_syscall);
            if let StopKind::Terminated(t) = stop {
                break t;
            }

            if first {
                self.dispatch(&Event::Attach);
                self.kernel.set_options(pid)?;
            }

            let next = match stop {
                StopKind::SyscallEnter | StopKind::SyscallExit => {
                    in_syscall = stop == StopKind::SyscallEnter;
                    match self.on_syscall_stop(in_syscall) {
                        Ok(None) => { Next::Resume(None) }
                        Ok(Some(syscall)) => {
                            self.protection_fault(pid, syscall)?;
                            exit_reason = ExitReason::ProtectionFault;
                            exiting_sent = true;
                            Next::Reap
                        }
                        // It died between the stop and the register read
                        Err(e) if e.is_tracee_gone() => { Next::Reap }
                        Err(e) => { return Err(e) }
                    }
                }
                StopKind::ExitNotify => {
                    if !exiting_sent {
                        self.dispatch(&Event::Exiting { reason : exit_reason });
                        exiting_sent = true;
                    }
                    Next::Resume(None)
                }
                StopKind::SignalDelivered(sig) => {
                    // The first stop is the child's own SIGSTOP.  Re-delivering
                    // it makes some runtimes print and re-raise it.
                    if first {
                        Next::Resume(None)
                    } else {
                        self.dispatch(&Event::Signal { signal : sig });
                        // SIGTRAP is ptrace's (e.g. the post-exec trap)
                        if sig == libc::SIGTRAP { Next::Resume(None) } else { Next::Resume(Some(sig)) }
                    }
                }
                StopKind::Terminated(t) => { break t; }
            };
            first = false;

            if let Next::Resume(signal) = next {
                let how = if self.trace_syscalls { Resume::Syscall } else { Resume::Continue };
                match self.kernel.resume(pid, how, signal) {
                    Ok(()) => { }
                    Err(e) if e.is_tracee_gone() => { debug!("Tracee {} vanished before restart", pid) }
                    Err(e) => { return Err(e) }
                }
            }
        };

        // A syscall entry that never saw its exit (the tracee was killed in
        // between) must not leave the hook armed.
        if self.debugger.take_return_hook().is_some() {
            debug!("Dropping unfired return hook for {}", pid);
        }
        if !exiting_sent {
            self.dispatch(&Event::Exiting { reason : exit_reason });
        }
        self.exit_reason = Some(exit_reason);
        self.dispatch(&Event::Exited { reason : exit_reason });
        info!("Tracee {} terminated: {:?} ({:?}, ran {:?})", pid, termination, exit_reason, self.execution_time);
        Ok(termination.status())
    }

    /// Handle a syscall-stop.  Returns the offending syscall if the tracee must
    /// be killed.
    fn on_syscall_stop(&mut self, entering : bool) -> Result<Option<SyscallId>> {
        let syscall = self.debugger.syscall()?;

        if !self.initialized {
            // A successful execve does not return to the old image, so being
            // at its exit means the target program is in place.
            if !entering && syscall == self.debugger.execve_syscall() {
                self.initialized = true;
                info!("Tracee {:?} initialized; policing syscalls", self.pid);
            }
            return Ok(None);
        }

        if entering {
            if self.debugger.foreign_abi()? {
                warn!("Tracee {:?} made syscall {} through a foreign ABI", self.pid, syscall);
                return Ok(Some(syscall));
            }
            return if self.permits(syscall)? { Ok(None) } else { Ok(Some(syscall)) };
        }

        if let Some(hook) = self.debugger.take_return_hook() {
            let ret = self.debugger.return_value()?;
            hook(syscall, ret);
        }
        Ok(None)
    }

    fn permits(&mut self, syscall : SyscallId) -> Result<bool> {
        let action = self.handlers.lookup(syscall);
        let allowed = match action {
            PolicyAction::Allow => { true }
            PolicyAction::RestrictedStdoutErr => {
                let fd = self.debugger.arg(0)?;
                fd == 1 || fd == 2
            }
            PolicyAction::Dynamic => {
                match self.dynamic_callback.as_mut() {
                    Some(cb) => { cb(&mut SyscallContext::new(syscall, self.debugger.as_mut())) }
                    None => {
                        warn!("Syscall {} is dynamic but no dynamic callback is set", syscall);
                        false
                    }
                }
            }
            PolicyAction::Disallow => { false }
        };
        debug!("Syscall {}: {} -> {}", syscall, action, if allowed { "allowed" } else { "denied" });
        Ok(allowed)
    }

    fn protection_fault(&mut self, pid : Pid, syscall : SyscallId) -> Result<()> {
        warn!("Tracee {} made forbidden syscall {}; killing it", pid, syscall);
        self.dispatch(&Event::ProtectionViolation { syscall });
        self.dispatch(&Event::Exiting { reason : ExitReason::ProtectionFault });
        match self.kernel.kill(pid) {
            Err(e) if !e.is_tracee_gone() => { Err(e) }
            _ => { Ok(()) }
        }
    }
}
