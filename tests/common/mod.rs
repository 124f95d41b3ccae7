use std::cell::RefCell;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::rc::Rc;

use nix::unistd::{execv, Pid};

use ptbox::ptbox::event::{Event, ExitReason};
use ptbox::ptbox::process::TracedProcess;

pub const SIGKILL : i32 = 9;
pub const SIGUSR1 : i32 = 10;

// Subscribe to the events of `process`, returning the list they are collected in
pub fn record_events(process : &mut TracedProcess) -> Rc<RefCell<Vec<Event>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    process.subscribe(move |evt| { sink.borrow_mut().push(*evt); 0 });
    events
}

// Spawn `argv` (resolved through PATH) as the tracee.
//
// The arguments are converted before the fork so the child only has to exec.
pub fn spawn_command(process : &mut TracedProcess, argv : &[&str]) -> anyhow::Result<Pid> {
    let cmd_path = which::which(OsString::from(argv[0]))?;
    let path = CString::new(cmd_path.as_os_str().as_bytes())?;
    let args = argv.iter()
        .map(|a| CString::new(*a))
        .collect::<Result<Vec<_>, _>>()?;
    let pid = process.spawn(|| {
        let _ = execv(&path, &args);
        127
    })?;
    Ok(pid)
}

// The events every run ends with
pub fn ending(reason : ExitReason) -> Vec<Event> {
    vec![Event::Exiting { reason }, Event::Exited { reason }]
}

pub fn tail(events : &[Event], n : usize) -> Vec<Event> {
    events[events.len().saturating_sub(n)..].to_vec()
}
