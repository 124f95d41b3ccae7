use std::collections::BTreeMap;

use crate::ptbox::debugger::{Arch, SyscallId};
use crate::ptbox::error::{PtboxError, Result};

const SYSCALLS: &'static str = include_str!("../../data/syscalls_x64.tsv");

/// Create a map of syscall numbers (for Linux x86_64) to their symbol names
pub fn load_syscalls() -> BTreeMap<SyscallId, String> {
    let mut syscalls = BTreeMap::new();

    for line in SYSCALLS.split_terminator('\n') {
        let mut cols = line.split('\t');
        if let (Some(num), Some(name)) = (cols.next(), cols.next()) {
            if let Ok(callno) = num.parse() {
                syscalls.insert(callno, name.to_owned());
            }
        }
    }

    syscalls
}

/// Two-way mapping between syscall names and numbers for one ABI.
///
/// Only the x86_64 table is bundled; for any other ABI, syscalls can still be
/// named by number.
#[derive(Debug,Clone,Default)]
pub struct SyscallNames {
    by_id : BTreeMap<SyscallId, String>,
    by_name : BTreeMap<String, SyscallId>
}

impl SyscallNames {
    pub fn for_arch(arch : Arch) -> Self {
        match arch {
            Arch::X64 => {
                let by_id = load_syscalls();
                let by_name = by_id.iter().map(|(id, name)| (name.clone(), *id)).collect();
                SyscallNames { by_id, by_name }
            }
            _ => { SyscallNames::default() }
        }
    }

    pub fn name(&self, id : SyscallId) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }

    /// Resolve a syscall given either by name or by decimal number
    pub fn id(&self, name : &str) -> Result<SyscallId> {
        if let Ok(id) = name.parse::<SyscallId>() {
            return Ok(id);
        }
        self.by_name.get(name).copied().ok_or_else(|| PtboxError::UnknownSyscall(name.to_owned()))
    }

    /// A printable name, falling back to the number
    pub fn describe(&self, id : SyscallId) -> String {
        match self.name(id) {
            Some(name) => { name.to_owned() }
            None => { format!("syscall_{}", id) }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SyscallId, &str)> + '_ {
        self.by_id.iter().map(|(id, name)| (*id, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_numbers() {
        let syscalls = load_syscalls();
        assert_eq!(syscalls.get(&0).map(|s| s.as_str()), Some("read"));
        assert_eq!(syscalls.get(&59).map(|s| s.as_str()), Some("execve"));
        assert_eq!(syscalls.get(&231).map(|s| s.as_str()), Some("exit_group"));
        assert_eq!(syscalls.get(&257).map(|s| s.as_str()), Some("openat"));
        assert_eq!(syscalls.get(&435).map(|s| s.as_str()), Some("clone3"));
        // 335-423 are unassigned on x86_64
        assert!(syscalls.get(&400).is_none());
    }

    #[test]
    fn test_lookup_by_name_or_number() -> anyhow::Result<()> {
        let names = SyscallNames::for_arch(Arch::X64);
        assert_eq!(names.id("write")?, 1);
        assert_eq!(names.id("60")?, 60);
        assert_eq!(names.name(60), Some("exit"));
        assert_eq!(names.describe(999), "syscall_999");
        assert!(matches!(names.id("frobnicate"), Err(PtboxError::UnknownSyscall(_))));
        Ok(())
    }

    #[test]
    fn test_other_abis_take_numbers() -> anyhow::Result<()> {
        let names = SyscallNames::for_arch(Arch::Aarch64);
        assert_eq!(names.id("221")?, 221);
        assert!(names.id("execve").is_err());
        assert_eq!(names.iter().count(), 0);
        Ok(())
    }
}
