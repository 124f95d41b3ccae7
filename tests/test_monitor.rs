// These tests trace real child processes, so they need a host where ptrace of
// our own children is permitted.  Syscall numbers are the x86_64 ones.
#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serial_test::serial;

use ptbox::ptbox::debugger::{SyscallId, Word};
use ptbox::ptbox::error::PtboxError;
use ptbox::ptbox::event::{Event, ExitReason};
use ptbox::ptbox::handler::{HandlerTable, PolicyAction};
use ptbox::ptbox::process::TracedProcess;

mod common;
use common::{ending, record_events, spawn_command, tail, SIGKILL, SIGUSR1};

const BRK : SyscallId = 12;
const EXIT_GROUP : SyscallId = 231;

#[serial]
#[test_log::test]
fn test_true_exits_normally() -> anyhow::Result<()> {
    let mut process = TracedProcess::native()?;
    process.set_handlers(HandlerTable::allow_all());
    let events = record_events(&mut process);
    spawn_command(&mut process, &["true"])?;

    assert_eq!(process.monitor()?, 0);
    let events = events.borrow();
    assert_eq!(events.first(), Some(&Event::Attach));
    assert_eq!(tail(&events, 2), ending(ExitReason::Normal));
    assert!(process.initialized());
    assert!(process.execution_time() > Duration::ZERO);
    assert_eq!(process.exit_reason(), Some(ExitReason::Normal));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_exit_status_is_returned() -> anyhow::Result<()> {
    let mut process = TracedProcess::native()?;
    process.set_handlers(HandlerTable::allow_all());
    spawn_command(&mut process, &["sh", "-c", "exit 3"])?;
    assert_eq!(process.monitor()?, 3);
    Ok(())
}

#[serial]
#[test_log::test]
fn test_disallowed_syscall_is_killed() -> anyhow::Result<()> {
    // Every program ends with exit_group
    let mut handlers = HandlerTable::allow_all();
    handlers.set_handler(EXIT_GROUP, PolicyAction::Disallow)?;
    let mut process = TracedProcess::native()?;
    process.set_handlers(handlers);
    let events = record_events(&mut process);
    spawn_command(&mut process, &["true"])?;

    assert_eq!(process.monitor()?, -SIGKILL);
    let events = events.borrow();
    assert_eq!(tail(&events, 3),
               vec![Event::ProtectionViolation { syscall : EXIT_GROUP },
                    Event::Exiting { reason : ExitReason::ProtectionFault },
                    Event::Exited { reason : ExitReason::ProtectionFault }]);
    assert_eq!(process.exit_reason(), Some(ExitReason::ProtectionFault));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_bootstrap_is_not_policed() -> anyhow::Result<()> {
    // Nothing is allowed at all, yet the child gets as far as the exec
    let mut process = TracedProcess::native()?;
    let events = record_events(&mut process);
    let path = std::ffi::CString::new("/bin/true")?;
    let args = vec![path.clone()];
    process.spawn(|| {
        let _ = nix::unistd::getpid();
        let _ = nix::unistd::execv(&path, &args);
        127
    })?;

    assert_eq!(process.monitor()?, -SIGKILL);
    assert!(process.initialized());
    let events = events.borrow();
    assert!(events.iter().any(|e| matches!(e, Event::ProtectionViolation { .. })));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_untraced_syscalls_run_freely() -> anyhow::Result<()> {
    let mut process = TracedProcess::native()?;
    process.set_trace_syscalls(false);
    let events = record_events(&mut process);
    spawn_command(&mut process, &["true"])?;

    assert_eq!(process.monitor()?, 0);
    let events = events.borrow();
    assert!(!events.iter().any(|e| matches!(e, Event::ProtectionViolation { .. })));
    assert_eq!(tail(&events, 2), ending(ExitReason::Normal));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_signals_are_reported_and_forwarded() -> anyhow::Result<()> {
    let mut process = TracedProcess::native()?;
    process.set_handlers(HandlerTable::allow_all());
    let events = record_events(&mut process);
    spawn_command(&mut process, &["sh", "-c", "kill -USR1 $$"])?;

    assert_eq!(process.monitor()?, -SIGUSR1);
    let events = events.borrow();
    assert!(events.contains(&Event::Signal { signal : SIGUSR1 }));
    assert_eq!(tail(&events, 2), ending(ExitReason::Normal));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_self_kill_is_not_a_fault() -> anyhow::Result<()> {
    let mut process = TracedProcess::native()?;
    process.set_handlers(HandlerTable::allow_all());
    let events = record_events(&mut process);
    spawn_command(&mut process, &["sh", "-c", "kill -9 $$"])?;

    assert_eq!(process.monitor()?, -SIGKILL);
    assert_eq!(tail(&events.borrow(), 2), ending(ExitReason::Normal));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_stdout_is_allowed() -> anyhow::Result<()> {
    let mut handlers = HandlerTable::allow_all();
    handlers.set_handler(1, PolicyAction::RestrictedStdoutErr)?;
    let mut process = TracedProcess::native()?;
    process.set_handlers(handlers);
    spawn_command(&mut process, &["sh", "-c", "echo ptbox"])?;
    assert_eq!(process.monitor()?, 0);
    Ok(())
}

#[serial]
#[test_log::test]
fn test_dynamic_callback_sees_arguments() -> anyhow::Result<()> {
    let mut handlers = HandlerTable::allow_all();
    handlers.set_handler(BRK, PolicyAction::Dynamic)?;
    handlers.set_handler(EXIT_GROUP, PolicyAction::Dynamic)?;
    let mut process = TracedProcess::native()?;
    process.set_handlers(handlers);

    let exit_codes = Rc::new(RefCell::new(Vec::new()));
    let brks = Rc::new(RefCell::new(Vec::new()));
    let (codes, breaks) = (exit_codes.clone(), brks.clone());
    process.set_dynamic_callback(move |ctx| {
        if ctx.id() == EXIT_GROUP {
            codes.borrow_mut().push(ctx.arg(0).unwrap_or(Word::MAX));
        } else {
            let breaks = breaks.clone();
            ctx.on_return(Box::new(move |sc : SyscallId, ret : Word| breaks.borrow_mut().push((sc, ret))));
        }
        true
    });
    spawn_command(&mut process, &["sh", "-c", "exit 5"])?;

    assert_eq!(process.monitor()?, 5);
    assert_eq!(*exit_codes.borrow(), vec![5]);
    let brks = brks.borrow();
    assert!(!brks.is_empty());
    assert!(brks.iter().all(|(sc, ret)| *sc == BRK && *ret != 0));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_child_that_returns() -> anyhow::Result<()> {
    let mut process = TracedProcess::native()?;
    let events = record_events(&mut process);
    let pid = process.spawn(|| 7)?;

    assert_eq!(process.monitor()?, 7);
    assert!(!process.initialized());
    assert_eq!(tail(&events.borrow(), 2), ending(ExitReason::Normal));
    assert!(matches!(process.spawn(|| 0), Err(PtboxError::AlreadySpawned(p)) if p == pid));
    Ok(())
}
