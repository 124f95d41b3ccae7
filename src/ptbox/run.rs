use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::{CString, OsString};
use std::fs;
use std::io::{BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;

use log::{info, warn};
use nix::unistd::{execv, Pid};

use crate::ptbox::debugger::{Arch, SyscallId, Word};
use crate::ptbox::error::PtboxError;
use crate::ptbox::event::{Event, TraceEvent};
use crate::ptbox::handler::{HandlerTable, PolicyAction};
use crate::ptbox::options::{Preset, RunOptions, SyscallsOptions};
use crate::ptbox::process::{SyscallContext, TracedProcess};
use crate::ptbox::syscalls::SyscallNames;

/// Exit status of the child when the command could not be executed
pub const EXEC_FAILED : i32 = 127;

#[derive(thiserror::Error,Debug)]
pub enum RunError {
    #[error("No command given")]
    NoCommandGiven
}

// The exec that starts the program is never policed, so execve is left out:
// allowing it would let the program replace itself with anything.
const BASIC_ALLOW : &[&str] = &[
    "read", "pread64", "readv", "lseek", "close", "fstat", "newfstatat", "stat", "lstat", "statx",
    "fstatfs", "statfs", "getdents64", "getcwd", "fadvise64", "fcntl", "ioctl",
    "brk", "mmap", "munmap", "mprotect", "mremap", "madvise", "arch_prctl", "set_tid_address",
    "set_robust_list", "rseq", "prlimit64", "getrandom", "uname", "sysinfo", "readlink", "access",
    "faccessat", "faccessat2", "getpid", "gettid", "getuid", "geteuid", "getgid", "getegid",
    "sched_getaffinity", "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "sigaltstack",
    "futex", "clock_gettime", "clock_getres", "gettimeofday", "nanosleep", "clock_nanosleep",
    "exit", "exit_group"
];

const BASIC_STDIO : &[&str] = &["write", "writev"];

/// Opening syscalls, with the index of their flags argument
const BASIC_READ_ONLY_OPENS : &[(&str, usize)] = &[("open", 1), ("openat", 2)];

/// True if open flags neither allow writing nor create or truncate anything
pub fn is_read_only(flags : Word) -> bool {
    let flags = flags as libc::c_int;
    flags & libc::O_ACCMODE == libc::O_RDONLY && flags & (libc::O_CREAT | libc::O_TRUNC) == 0
}

/// Decisions for the syscalls the handler table marks `Dynamic`
#[derive(Debug,Default)]
pub struct DynamicPolicy {
    read_only_opens : BTreeMap<SyscallId, usize>,
    audited : BTreeMap<SyscallId, String>
}

impl DynamicPolicy {
    pub fn decide(&self, ctx : &mut SyscallContext<'_>) -> bool {
        let id = ctx.id();
        if let Some(flags_index) = self.read_only_opens.get(&id) {
            return match ctx.arg(*flags_index) {
                Ok(flags) => { is_read_only(flags) }
                Err(e) => {
                    warn!("Cannot read open flags of syscall {}: {}", id, e);
                    false
                }
            };
        }

        match self.audited.get(&id) {
            Some(name) => {
                let args : Vec<String> = (0..6)
                    .map(|i| ctx.arg(i).map_or("?".to_owned(), |a| format!("{:#x}", a)))
                    .collect();
                info!("{}({})", name, args.join(", "));
                let name = name.clone();
                ctx.on_return(Box::new(move |_ : SyscallId, ret : Word| info!("{} = {}", name, ret as i64)));
                true
            }
            None => { false }
        }
    }
}

/// Turn the command line policy into a handler table
pub fn build_policy(run_opts : &RunOptions, names : &SyscallNames) -> anyhow::Result<(HandlerTable, DynamicPolicy)> {
    let mut handlers = HandlerTable::new();
    let mut policy = DynamicPolicy::default();

    match run_opts.preset {
        Some(Preset::Permissive) => { handlers = HandlerTable::allow_all(); }
        Some(Preset::Basic) => {
            for name in BASIC_ALLOW {
                handlers.set_handler(names.id(name)?, PolicyAction::Allow)?;
            }
            for name in BASIC_STDIO {
                handlers.set_handler(names.id(name)?, PolicyAction::RestrictedStdoutErr)?;
            }
            for (name, flags_index) in BASIC_READ_ONLY_OPENS {
                let id = names.id(name)?;
                handlers.set_handler(id, PolicyAction::Dynamic)?;
                policy.read_only_opens.insert(id, *flags_index);
            }
        }
        None => { }
    }

    for name in &run_opts.allow {
        handlers.set_handler(names.id(name)?, PolicyAction::Allow)?;
    }
    for name in &run_opts.stdio {
        handlers.set_handler(names.id(name)?, PolicyAction::RestrictedStdoutErr)?;
    }
    for name in &run_opts.audit {
        let id = names.id(name)?;
        handlers.set_handler(id, PolicyAction::Dynamic)?;
        policy.read_only_opens.remove(&id);
        policy.audited.insert(id, names.describe(id));
    }
    for name in &run_opts.deny {
        handlers.set_handler(names.id(name)?, PolicyAction::Disallow)?;
    }

    Ok((handlers, policy))
}

pub fn run_entrypoint(run_opts : &RunOptions) -> anyhow::Result<i32> {
    if run_opts.command.is_empty() {
        return Err(anyhow::Error::new(RunError::NoCommandGiven));
    }

    let mut process = TracedProcess::native()?;
    let names = SyscallNames::for_arch(process.debugger().arch());
    let (handlers, policy) = build_policy(run_opts, &names)?;
    process.set_handlers(handlers);
    process.set_trace_syscalls(!run_opts.no_trace_syscalls);
    process.set_dynamic_callback(move |ctx| policy.decide(ctx));

    // Events are only collected while tracing: the tracee is stopped while the
    // callback runs.
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    process.subscribe(move |evt| { sink.borrow_mut().push(*evt); 0 });

    // Everything the child needs is allocated before the fork
    let cmd_path = which::which(OsString::from(&run_opts.command[0]))?;
    let path = CString::new(cmd_path.as_os_str().as_bytes())?;
    let argv = run_opts.command.iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<Vec<_>, _>>()?;

    let pid = process.spawn(|| {
        let _ = execv(&path, &argv);
        EXEC_FAILED
    })?;
    let status = process.monitor()?;

    let events = events.borrow();
    if let Some(events_path) = &run_opts.events {
        write_events(events_path, pid, &events)?;
    }
    print_summary(&process, status, &events, &names);

    if status >= 0 { Ok(status) } else { Ok(128 - status) }
}

fn write_events(path : &Path, pid : Pid, events : &[Event]) -> anyhow::Result<()> {
    let mut f = BufWriter::new(fs::File::create(path)?);
    for evt in events {
        let te = TraceEvent { pid : pid.as_raw(), evt : *evt };
        serde_json::to_writer(&mut f, &te)?;
        f.write_all(b"\n")?;
    }
    f.flush()?;
    Ok(())
}

fn print_summary(process : &TracedProcess, status : i32, events : &[Event], names : &SyscallNames) {
    for evt in events {
        if let Event::ProtectionViolation { syscall } = evt {
            eprintln!("ptbox: killed for forbidden syscall {}", names.describe(*syscall));
        }
    }
    let outcome = if status >= 0 { format!("exited with {}", status) } else { format!("killed by signal {}", -status) };
    eprintln!("ptbox: {} ({:?}); {:.3}s wall, {:.3}s cpu, {} KB max rss",
              outcome,
              process.exit_reason(),
              process.execution_time().as_secs_f64(),
              process.cpu_time().as_secs_f64(),
              process.max_memory_kb());
}

pub fn syscalls_entrypoint(syscalls_opts : &SyscallsOptions) -> anyhow::Result<()> {
    let arch = Arch::native().ok_or(PtboxError::UnsupportedHost)?;
    let names = SyscallNames::for_arch(arch);
    if syscalls_opts.names.is_empty() {
        for (id, name) in names.iter() {
            println!("{}\t{}", id, name);
        }
    } else {
        for name in &syscalls_opts.names {
            let id = names.id(name)?;
            println!("{}\t{}", id, names.describe(id));
        }
    }
    Ok(())
}
