use std::fmt;

use serde::{Serialize,Deserialize};

use crate::ptbox::debugger::SyscallId;
use crate::ptbox::error::{PtboxError, Result};

/// Number of entries in a handler table; valid syscall ids are `0..MAX_SYSCALL`
pub const MAX_SYSCALL : usize = 512;

/// What the monitor does when the tracee enters a syscall
#[derive(Debug,Serialize,Deserialize,Clone,Copy,Hash,Eq,PartialEq)]
pub enum PolicyAction {
    /// Let the syscall through unexamined
    Allow,
    /// Kill the tracee
    Disallow,
    /// Allow only if the first argument is stdout or stderr
    RestrictedStdoutErr,
    /// Ask the owner's dynamic callback
    Dynamic
}

impl Default for PolicyAction {
    fn default() -> Self { PolicyAction::Disallow }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyAction::Allow => { "allow" }
            PolicyAction::Disallow => { "disallow" }
            PolicyAction::RestrictedStdoutErr => { "stdout-stderr" }
            PolicyAction::Dynamic => { "dynamic" }
        };
        f.write_str(s)
    }
}

/// A fixed-size map from syscall id to the action taken on entry.
///
/// Anything never set (and anything out of range) is `Disallow`.
#[derive(Clone,Eq,PartialEq)]
pub struct HandlerTable {
    actions : Box<[PolicyAction; MAX_SYSCALL]>
}

impl HandlerTable {
    pub fn new() -> Self {
        HandlerTable { actions : Box::new([PolicyAction::Disallow; MAX_SYSCALL]) }
    }

    /// A table that lets every in-range syscall through
    pub fn allow_all() -> Self {
        HandlerTable { actions : Box::new([PolicyAction::Allow; MAX_SYSCALL]) }
    }

    pub fn set_handler(&mut self, syscall : SyscallId, action : PolicyAction) -> Result<()> {
        let idx = Self::index(syscall).ok_or(PtboxError::InvalidSyscall(syscall))?;
        self.actions[idx] = action;
        Ok(())
    }

    pub fn lookup(&self, syscall : SyscallId) -> PolicyAction {
        Self::index(syscall).map_or(PolicyAction::Disallow, |idx| self.actions[idx])
    }

    /// Iterate over the ids that are not `Disallow`
    pub fn permitted(&self) -> impl Iterator<Item = (SyscallId, PolicyAction)> + '_ {
        self.actions.iter()
            .enumerate()
            .filter(|(_, a)| **a != PolicyAction::Disallow)
            .map(|(i, a)| (i as SyscallId, *a))
    }

    fn index(syscall : SyscallId) -> Option<usize> {
        usize::try_from(syscall).ok().filter(|idx| *idx < MAX_SYSCALL)
    }
}

impl Default for HandlerTable {
    fn default() -> Self { HandlerTable::new() }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.permitted()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_is_disallow() {
        let t = HandlerTable::new();
        for sc in 0..MAX_SYSCALL as SyscallId {
            assert_eq!(t.lookup(sc), PolicyAction::Disallow);
        }
        assert_eq!(t.lookup(MAX_SYSCALL as SyscallId), PolicyAction::Disallow);
        assert_eq!(t.lookup(u64::MAX), PolicyAction::Disallow);
    }

    #[test]
    fn test_set_then_lookup() -> anyhow::Result<()> {
        let actions = [PolicyAction::Allow, PolicyAction::RestrictedStdoutErr,
                       PolicyAction::Dynamic, PolicyAction::Disallow];
        let mut t = HandlerTable::new();
        for sc in 0..MAX_SYSCALL as SyscallId {
            let a = actions[sc as usize % actions.len()];
            t.set_handler(sc, a)?;
            assert_eq!(t.lookup(sc), a);
        }
        Ok(())
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut t = HandlerTable::new();
        let before = t.clone();
        let res = t.set_handler(MAX_SYSCALL as SyscallId, PolicyAction::Allow);
        assert!(matches!(res, Err(PtboxError::InvalidSyscall(512))));
        assert!(t.set_handler(u64::MAX, PolicyAction::Allow).is_err());
        assert_eq!(t, before);
    }

    #[test]
    fn test_permitted() -> anyhow::Result<()> {
        let mut t = HandlerTable::new();
        t.set_handler(0, PolicyAction::Allow)?;
        t.set_handler(1, PolicyAction::RestrictedStdoutErr)?;
        let p : Vec<_> = t.permitted().collect();
        assert_eq!(p, vec![(0, PolicyAction::Allow), (1, PolicyAction::RestrictedStdoutErr)]);
        assert_eq!(HandlerTable::allow_all().permitted().count(), MAX_SYSCALL);
        Ok(())
    }

    #[test]
    fn test_action_names() {
        let names : Vec<String> = [PolicyAction::Allow, PolicyAction::Disallow,
                                   PolicyAction::RestrictedStdoutErr, PolicyAction::Dynamic]
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(names, vec!["allow", "disallow", "stdout-stderr", "dynamic"]);
        assert_eq!(format!("{:?}", HandlerTable::new()), "{}");
    }
}
