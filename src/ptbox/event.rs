use serde::{Serialize, Deserialize};

use crate::ptbox::debugger::SyscallId;

/// Why the traced process stopped running.  A protection fault always wins
/// over a normal exit.
#[derive(Debug,Serialize,Deserialize,Clone,Copy,Hash,Eq,PartialEq)]
pub enum ExitReason {
    Normal,
    ProtectionFault
}

impl ExitReason {
    pub fn code(&self) -> u64 {
        match self {
            ExitReason::Normal => { 0 }
            ExitReason::ProtectionFault => { 1 }
        }
    }
}

/// Numeric event kinds, for owners that want the `(kind, parameter)` form
#[derive(Debug,Serialize,Deserialize,Clone,Copy,Hash,Eq,PartialEq)]
pub enum EventKind {
    Attach = 0,
    Exiting = 1,
    Exited = 2,
    Signal = 4,
    Protection = 5
}

/// Lifecycle events, in the order a run produces them:
///
///   Attach, Signal*, ProtectionViolation?, Exiting, Exited
///
/// with signals possibly interleaved before `Exiting`.  `Exited` is always the
/// last event and is produced exactly once.
#[derive(Debug,Serialize,Deserialize,Clone,Copy,Hash,Eq,PartialEq)]
pub enum Event {
    Attach,
    Signal { signal : i32 },
    ProtectionViolation { syscall : SyscallId },
    Exiting { reason : ExitReason },
    Exited { reason : ExitReason }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Attach => { EventKind::Attach }
            Event::Signal { .. } => { EventKind::Signal }
            Event::ProtectionViolation { .. } => { EventKind::Protection }
            Event::Exiting { .. } => { EventKind::Exiting }
            Event::Exited { .. } => { EventKind::Exited }
        }
    }

    pub fn param(&self) -> u64 {
        match self {
            Event::Attach => { 0 }
            Event::Signal { signal } => { *signal as u64 }
            Event::ProtectionViolation { syscall } => { *syscall }
            Event::Exiting { reason } => { reason.code() }
            Event::Exited { reason } => { reason.code() }
        }
    }
}

/// An event stamped with the pid that produced it, as written to event logs
#[derive(Debug,Serialize,Deserialize,Clone)]
pub struct TraceEvent {
    pub pid : i32,
    pub evt : Event
}
