use std::mem::MaybeUninit;
use std::time::Duration;

use log::debug;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use serde::{Serialize,Deserialize};

use crate::ptbox::error::{PtboxError, Result};

/// Exit status of a child whose request to be traced failed
pub const TRACEME_FAILED : i32 = 126;

/// How a stopped tracee is restarted
#[derive(Debug,Clone,Copy,Eq,PartialEq)]
pub enum Resume {
    /// Run until the next syscall boundary (or signal, or exit)
    Syscall,
    /// Run until the next signal or exit
    Continue
}

/// Kernel accounting for the tracee, as of the last wait
#[derive(Debug,Serialize,Deserialize,Clone,Copy,Default,Eq,PartialEq)]
pub struct ResourceUsage {
    pub user_time : Duration,
    pub system_time : Duration,
    /// Peak resident set size, in kilobytes
    pub max_rss_kb : u64
}

impl ResourceUsage {
    pub fn cpu_time(&self) -> Duration {
        self.user_time + self.system_time
    }
}

fn timeval_duration(tv : libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

impl From<libc::rusage> for ResourceUsage {
    fn from(ru : libc::rusage) -> Self {
        ResourceUsage { user_time : timeval_duration(ru.ru_utime),
                        system_time : timeval_duration(ru.ru_stime),
                        max_rss_kb : ru.ru_maxrss.max(0) as u64 }
    }
}

/// The process-control primitives the monitor loop is built on.
///
/// `PtraceKernel` is the real thing; the seam exists so the state machine can
/// be driven by a scripted kernel.
pub trait Kernel {
    /// Fork.  The child requests tracing, stops itself with SIGSTOP, runs
    /// `child` and exits with its result.  Only the parent returns.
    fn spawn<'a>(&mut self, child : Box<dyn FnOnce() -> i32 + 'a>) -> Result<Pid>;
    /// Block until `pid` stops or terminates, returning the raw wait status
    fn wait(&mut self, pid : Pid) -> Result<(i32, ResourceUsage)>;
    /// Request syscall-stops that are distinguishable from SIGTRAP, and a stop
    /// when the tracee starts exiting
    fn set_options(&mut self, pid : Pid) -> Result<()>;
    fn resume(&mut self, pid : Pid, how : Resume, signal : Option<i32>) -> Result<()>;
    fn kill(&mut self, pid : Pid) -> Result<()>;
}

#[derive(Debug,Default)]
pub struct PtraceKernel;

impl Kernel for PtraceKernel {
    fn spawn<'a>(&mut self, child : Box<dyn FnOnce() -> i32 + 'a>) -> Result<Pid> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child : pid }) => { Ok(pid) }
            Ok(ForkResult::Child) => {
                // Nothing here may return to the caller: this is a copy of the
                // owner's address space.
                let code = match ptrace::traceme().and_then(|_| signal::raise(Signal::SIGSTOP)) {
                    Ok(()) => { child() }
                    Err(_) => { TRACEME_FAILED }
                };
                unsafe { libc::_exit(code) }
            }
            Err(e) => { Err(PtboxError::Fork(e)) }
        }
    }

    fn wait(&mut self, pid : Pid) -> Result<(i32, ResourceUsage)> {
        let mut status : libc::c_int = 0;
        let mut ru = MaybeUninit::<libc::rusage>::zeroed();
        loop {
            let res = unsafe { libc::wait4(pid.as_raw(), &mut status, libc::__WALL, ru.as_mut_ptr()) };
            match Errno::result(res) {
                Ok(_) => { break }
                Err(Errno::EINTR) => { continue }
                Err(e) => { return Err(PtboxError::Wait(pid, e)) }
            }
        }
        let ru = unsafe { ru.assume_init() };
        Ok((status, ResourceUsage::from(ru)))
    }

    fn set_options(&mut self, pid : Pid) -> Result<()> {
        // EXITKILL: the tracee must not run untraced if we go away
        let opts = Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACEEXIT | Options::PTRACE_O_EXITKILL;
        ptrace::setoptions(pid, opts).map_err(|e| PtboxError::Ptrace("PTRACE_SETOPTIONS", pid, e))
    }

    fn resume(&mut self, pid : Pid, how : Resume, signal : Option<i32>) -> Result<()> {
        let (request, name) = match how {
            Resume::Syscall => { (libc::PTRACE_SYSCALL, "PTRACE_SYSCALL") }
            Resume::Continue => { (libc::PTRACE_CONT, "PTRACE_CONT") }
        };
        match signal.map(Signal::try_from) {
            None => { restart(pid, how, None).map_err(|e| PtboxError::Ptrace(name, pid, e)) }
            Some(Ok(sig)) => { restart(pid, how, Some(sig)).map_err(|e| PtboxError::Ptrace(name, pid, e)) }
            Some(Err(_)) => {
                // Realtime signals have no `Signal` variant
                let sig = signal.unwrap_or(0);
                debug!("Forwarding raw signal {} to {}", sig, pid);
                let res = unsafe {
                    libc::ptrace(request, pid.as_raw(), std::ptr::null_mut::<libc::c_void>(), sig as libc::c_long)
                };
                Errno::result(res).map(drop).map_err(|e| PtboxError::Ptrace(name, pid, e))
            }
        }
    }

    fn kill(&mut self, pid : Pid) -> Result<()> {
        signal::kill(pid, Signal::SIGKILL).map_err(|e| PtboxError::Ptrace("SIGKILL", pid, e))
    }
}

fn restart(pid : Pid, how : Resume, sig : Option<Signal>) -> nix::Result<()> {
    match how {
        Resume::Syscall => { ptrace::syscall(pid, sig) }
        Resume::Continue => { ptrace::cont(pid, sig) }
    }
}
