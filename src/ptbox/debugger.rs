// Register access for a tracee stopped at a syscall boundary.
//
// The monitor loop never looks at registers directly; it only asks a
// `Debugger` for the syscall number, an argument, or the return value.  Each
// syscall ABI supplies its own implementation, and the owner picks one when
// constructing the traced process.
use nix::unistd::Pid;
use serde::{Serialize,Deserialize};

use crate::ptbox::error::{PtboxError, Result};

/// A syscall number in the tracee's ABI
pub type SyscallId = u64;
/// A raw register value
pub type Word = u64;

/// A one-shot callback run at the next syscall-exit stop with the syscall id
/// and its return value.
pub type ReturnHook = Box<dyn FnOnce(SyscallId, Word)>;

/// The syscall ABIs the sandbox knows how to debug
#[derive(Debug,Serialize,Deserialize,Clone,Copy,Hash,Eq,PartialEq)]
pub enum Arch {
    X64,
    /// A 32-bit x86 program running on an x86_64 kernel
    X86OnX64,
    Aarch64
}

impl Arch {
    pub fn native() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else {
            None
        }
    }
}

/// Returns true if processes of the given ABI can be traced from this host
pub fn can_debug(arch : Arch) -> bool {
    match arch {
        Arch::X64 | Arch::X86OnX64 => { cfg!(all(target_arch = "x86_64", target_os = "linux")) }
        Arch::Aarch64 => { cfg!(all(target_arch = "aarch64", target_os = "linux")) }
    }
}

/// Per-tracee state shared by every debugger implementation
#[derive(Default)]
pub struct Attachment {
    pid : Option<Pid>,
    on_return : Option<ReturnHook>
}

/// Read-only view of the registers of a tracee stopped at a syscall boundary.
///
/// Calling the register accessors while the tracee is not in a syscall-stop is
/// meaningless; the monitor loop never does.
pub trait Debugger {
    fn arch(&self) -> Arch;
    fn attachment(&self) -> &Attachment;
    fn attachment_mut(&mut self) -> &mut Attachment;

    /// The number of the syscall being entered or exited
    fn syscall(&self) -> Result<SyscallId>;
    /// Syscall argument `index` (0-5)
    fn arg(&self, index : usize) -> Result<Word>;
    /// The syscall result; only meaningful at a syscall-exit stop
    fn return_value(&self) -> Result<Word>;
    /// The number of the syscall that replaces the program image
    fn execve_syscall(&self) -> SyscallId;

    /// True if the syscall at this stop was made through another ABI than
    /// `arch()`, e.g. `int $0x80` from a 64-bit program.  Its number then
    /// means something else entirely.
    fn foreign_abi(&self) -> Result<bool> {
        Ok(false)
    }

    fn attach(&mut self, pid : Pid) {
        self.attachment_mut().pid = Some(pid);
    }

    fn pid(&self) -> Result<Pid> {
        self.attachment().pid.ok_or(PtboxError::NotSpawned)
    }

    fn set_return_hook(&mut self, hook : ReturnHook) {
        self.attachment_mut().on_return = Some(hook);
    }

    /// Disarm the return hook, handing it to the caller
    fn take_return_hook(&mut self) -> Option<ReturnHook> {
        self.attachment_mut().on_return.take()
    }
}

/// Construct the debugger for `arch`, if this host can trace it
pub fn debugger_for(arch : Arch) -> Result<Box<dyn Debugger>> {
    match arch {
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        Arch::X64 => { Ok(Box::new(x86_64::X64Debugger::default())) }
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        Arch::X86OnX64 => { Ok(Box::new(x86_64::X86OnX64Debugger::default())) }
        #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
        Arch::Aarch64 => { Ok(Box::new(aarch64::Aarch64Debugger::default())) }
        #[allow(unreachable_patterns)]
        other => { Err(PtboxError::UnsupportedArch(other)) }
    }
}

pub fn native_debugger() -> Result<Box<dyn Debugger>> {
    match Arch::native() {
        Some(arch) => { debugger_for(arch) }
        None => { Err(PtboxError::UnsupportedHost) }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub mod x86_64 {
    use std::mem::size_of;

    use nix::errno::Errno;
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    use super::{Arch, Attachment, Debugger, SyscallId, Word};
    use crate::ptbox::error::{PtboxError, Result};

    const PTRACE_GET_SYSCALL_INFO : u32 = 0x420e;
    const AUDIT_ARCH_X86_64 : u32 = 0xc000_003e;
    const AUDIT_ARCH_I386 : u32 = 0x4000_0003;
    // Code segment selectors of 64-bit and compat mode
    const USER_CS : u64 = 0x33;
    const USER32_CS : u64 = 0x23;

    fn registers(pid : Pid) -> Result<libc::user_regs_struct> {
        ptrace::getregs(pid).map_err(|e| PtboxError::Ptrace("PTRACE_GETREGS", pid, e))
    }

    /// The leading fields of `struct ptrace_syscall_info`; the kernel copies
    /// no more than we ask for.
    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    struct SyscallInfo {
        op : u8,
        pad : [u8; 3],
        arch : u32,
        instruction_pointer : u64,
        stack_pointer : u64
    }

    /// The AUDIT_ARCH_* value of the syscall at this stop, or `None` on
    /// kernels without PTRACE_GET_SYSCALL_INFO (before 5.3).
    ///
    /// This is the only reliable test: `int $0x80` from 64-bit code runs with
    /// the 64-bit code segment.
    fn syscall_arch(pid : Pid) -> Result<Option<u32>> {
        let mut info = SyscallInfo::default();
        let res = unsafe {
            libc::ptrace(PTRACE_GET_SYSCALL_INFO as _,
                         pid.as_raw(),
                         size_of::<SyscallInfo>() as *mut libc::c_void,
                         &mut info as *mut SyscallInfo)
        };
        match Errno::result(res) {
            Ok(_) => { Ok(Some(info.arch)) }
            Err(Errno::EIO) | Err(Errno::EINVAL) => { Ok(None) }
            Err(e) => { Err(PtboxError::Ptrace("PTRACE_GET_SYSCALL_INFO", pid, e)) }
        }
    }

    /// Native 64-bit ABI: number in orig_rax, arguments in rdi, rsi, rdx, r10,
    /// r8, r9.
    #[derive(Default)]
    pub struct X64Debugger {
        attachment : Attachment
    }

    impl Debugger for X64Debugger {
        fn arch(&self) -> Arch { Arch::X64 }
        fn attachment(&self) -> &Attachment { &self.attachment }
        fn attachment_mut(&mut self) -> &mut Attachment { &mut self.attachment }

        fn syscall(&self) -> Result<SyscallId> {
            Ok(registers(self.pid()?)?.orig_rax)
        }

        fn arg(&self, index : usize) -> Result<Word> {
            let regs = registers(self.pid()?)?;
            match index {
                0 => { Ok(regs.rdi) }
                1 => { Ok(regs.rsi) }
                2 => { Ok(regs.rdx) }
                3 => { Ok(regs.r10) }
                4 => { Ok(regs.r8) }
                5 => { Ok(regs.r9) }
                _ => { Err(PtboxError::InvalidArgument(index)) }
            }
        }

        fn return_value(&self) -> Result<Word> {
            Ok(registers(self.pid()?)?.rax)
        }

        fn execve_syscall(&self) -> SyscallId { 59 }

        fn foreign_abi(&self) -> Result<bool> {
            let pid = self.pid()?;
            match syscall_arch(pid)? {
                Some(arch) => { Ok(arch != AUDIT_ARCH_X86_64) }
                None => { Ok(registers(pid)?.cs == USER32_CS) }
            }
        }
    }

    /// i386 ABI seen through the 64-bit register set: number in orig_eax,
    /// arguments in ebx, ecx, edx, esi, edi, ebp.
    #[derive(Default)]
    pub struct X86OnX64Debugger {
        attachment : Attachment
    }

    fn low32(w : u64) -> Word {
        w as u32 as Word
    }

    impl Debugger for X86OnX64Debugger {
        fn arch(&self) -> Arch { Arch::X86OnX64 }
        fn attachment(&self) -> &Attachment { &self.attachment }
        fn attachment_mut(&mut self) -> &mut Attachment { &mut self.attachment }

        fn syscall(&self) -> Result<SyscallId> {
            Ok(low32(registers(self.pid()?)?.orig_rax))
        }

        fn arg(&self, index : usize) -> Result<Word> {
            let regs = registers(self.pid()?)?;
            match index {
                0 => { Ok(low32(regs.rbx)) }
                1 => { Ok(low32(regs.rcx)) }
                2 => { Ok(low32(regs.rdx)) }
                3 => { Ok(low32(regs.rsi)) }
                4 => { Ok(low32(regs.rdi)) }
                5 => { Ok(low32(regs.rbp)) }
                _ => { Err(PtboxError::InvalidArgument(index)) }
            }
        }

        // Sign-extend so that -errno reads the same as on the 64-bit ABI
        fn return_value(&self) -> Result<Word> {
            Ok(registers(self.pid()?)?.rax as u32 as i32 as i64 as Word)
        }

        fn execve_syscall(&self) -> SyscallId { 11 }

        fn foreign_abi(&self) -> Result<bool> {
            let pid = self.pid()?;
            match syscall_arch(pid)? {
                Some(arch) => { Ok(arch != AUDIT_ARCH_I386) }
                None => { Ok(registers(pid)?.cs == USER_CS) }
            }
        }
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
pub mod aarch64 {
    use std::mem::{size_of, MaybeUninit};

    use nix::errno::Errno;
    use nix::unistd::Pid;

    use super::{Arch, Attachment, Debugger, SyscallId, Word};
    use crate::ptbox::error::{PtboxError, Result};

    const NT_PRSTATUS : libc::c_int = 1;

    // aarch64 has no PTRACE_GETREGS; the general registers come from the
    // NT_PRSTATUS register set.
    fn registers(pid : Pid) -> Result<libc::user_regs_struct> {
        let mut regs = MaybeUninit::<libc::user_regs_struct>::uninit();
        let mut iov = libc::iovec {
            iov_base : regs.as_mut_ptr() as *mut libc::c_void,
            iov_len : size_of::<libc::user_regs_struct>()
        };
        let res = unsafe {
            libc::ptrace(libc::PTRACE_GETREGSET,
                         pid.as_raw(),
                         NT_PRSTATUS as usize as *mut libc::c_void,
                         &mut iov as *mut libc::iovec)
        };
        Errno::result(res).map_err(|e| PtboxError::Ptrace("PTRACE_GETREGSET", pid, e))?;
        Ok(unsafe { regs.assume_init() })
    }

    /// Number in x8, arguments in x0-x5.  x0 is overwritten by the result at
    /// syscall exit.
    #[derive(Default)]
    pub struct Aarch64Debugger {
        attachment : Attachment
    }

    impl Debugger for Aarch64Debugger {
        fn arch(&self) -> Arch { Arch::Aarch64 }
        fn attachment(&self) -> &Attachment { &self.attachment }
        fn attachment_mut(&mut self) -> &mut Attachment { &mut self.attachment }

        fn syscall(&self) -> Result<SyscallId> {
            Ok(registers(self.pid()?)?.regs[8])
        }

        fn arg(&self, index : usize) -> Result<Word> {
            if index > 5 {
                return Err(PtboxError::InvalidArgument(index));
            }
            Ok(registers(self.pid()?)?.regs[index])
        }

        fn return_value(&self) -> Result<Word> {
            Ok(registers(self.pid()?)?.regs[0])
        }

        fn execve_syscall(&self) -> SyscallId { 221 }
    }
}
