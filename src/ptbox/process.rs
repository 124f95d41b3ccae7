use std::time::Duration;

use log::{debug, info};
use nix::unistd::Pid;

use crate::ptbox::debugger::{native_debugger, Debugger, ReturnHook, SyscallId, Word};
use crate::ptbox::error::{PtboxError, Result};
use crate::ptbox::event::{Event, ExitReason};
use crate::ptbox::handler::{HandlerTable, PolicyAction};
use crate::ptbox::kernel::{Kernel, PtraceKernel, ResourceUsage};

/// Returned by `dispatch` when nobody subscribed to events
pub const NO_SUBSCRIBER : i32 = -1;

/// Receives every lifecycle event; the return value is reserved for the owner
pub type EventCallback = Box<dyn FnMut(&Event) -> i32>;

/// Decides syscalls whose handler is `PolicyAction::Dynamic`; `false` kills
/// the tracee
pub type DynamicCallback = Box<dyn FnMut(&mut SyscallContext<'_>) -> bool>;

/// The view a dynamic callback gets of the syscall being decided.
///
/// The tracee is frozen while the callback runs, so the callback must not wait
/// on anything the tracee would have to do.
pub struct SyscallContext<'a> {
    id : SyscallId,
    debugger : &'a mut dyn Debugger
}

impl<'a> SyscallContext<'a> {
    pub(crate) fn new(id : SyscallId, debugger : &'a mut dyn Debugger) -> Self {
        SyscallContext { id, debugger }
    }

    pub fn id(&self) -> SyscallId {
        self.id
    }

    pub fn arg(&self, index : usize) -> Result<Word> {
        self.debugger.arg(index)
    }

    /// Run `hook` with the result of this syscall when it returns.  Only one
    /// hook can be armed at a time; a later call replaces an earlier one.
    pub fn on_return(&mut self, hook : ReturnHook) {
        self.debugger.set_return_hook(hook);
    }
}

/// One traced child: its pid, its policy, and what we measured about it.
///
/// A `TracedProcess` is good for exactly one spawn.  It is deliberately not
/// `Send`: ptrace only accepts requests from the thread that spawned the
/// tracee, so `spawn` and `monitor` must be called on the same thread.
///
/// Callbacks must not panic.  A panic unwinds out of `monitor` and may leave
/// the tracee stopped.
pub struct TracedProcess {
    pub(crate) pid : Option<Pid>,
    pub(crate) debugger : Box<dyn Debugger>,
    pub(crate) kernel : Box<dyn Kernel>,
    pub(crate) handlers : HandlerTable,
    pub(crate) event_callback : Option<EventCallback>,
    pub(crate) dynamic_callback : Option<DynamicCallback>,
    pub(crate) execution_time : Duration,
    pub(crate) usage : ResourceUsage,
    pub(crate) initialized : bool,
    pub(crate) trace_syscalls : bool,
    pub(crate) exit_reason : Option<ExitReason>
}

impl TracedProcess {
    pub fn new(debugger : Box<dyn Debugger>) -> Self {
        Self::with_kernel(debugger, Box::new(PtraceKernel))
    }

    /// A process traced with the debugger for the host's own ABI
    pub fn native() -> Result<Self> {
        Ok(Self::new(native_debugger()?))
    }

    pub fn with_kernel(debugger : Box<dyn Debugger>, kernel : Box<dyn Kernel>) -> Self {
        TracedProcess { pid : None,
                        debugger,
                        kernel,
                        handlers : HandlerTable::new(),
                        event_callback : None,
                        dynamic_callback : None,
                        execution_time : Duration::ZERO,
                        usage : ResourceUsage::default(),
                        initialized : false,
                        trace_syscalls : true,
                        exit_reason : None }
    }

    /// Fork the tracee.
    ///
    /// `child` runs in the new process once it is traced and has stopped
    /// itself.  It is expected to exec the target program; if it returns
    /// instead, its value is the exit status.  Syscalls made before the exec
    /// are never policed.
    pub fn spawn<'a, F>(&mut self, child : F) -> Result<Pid>
        where F : FnOnce() -> i32 + 'a
    {
        if let Some(pid) = self.pid {
            return Err(PtboxError::AlreadySpawned(pid));
        }
        let pid = self.kernel.spawn(Box::new(child))?;
        self.pid = Some(pid);
        self.debugger.attach(pid);
        info!("Spawned tracee {} ({:?} ABI)", pid, self.debugger.arch());
        Ok(pid)
    }

    /// When false, the tracee only stops for signals and exit: syscalls are
    /// never examined.
    pub fn set_trace_syscalls(&mut self, trace : bool) {
        self.trace_syscalls = trace;
    }

    pub fn trace_syscalls(&self) -> bool {
        self.trace_syscalls
    }

    pub fn set_handler(&mut self, syscall : SyscallId, action : PolicyAction) -> Result<()> {
        self.handlers.set_handler(syscall, action)
    }

    pub fn set_handlers(&mut self, handlers : HandlerTable) {
        self.handlers = handlers;
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn subscribe<F>(&mut self, callback : F)
        where F : FnMut(&Event) -> i32 + 'static
    {
        self.event_callback = Some(Box::new(callback));
    }

    pub fn set_dynamic_callback<F>(&mut self, callback : F)
        where F : FnMut(&mut SyscallContext<'_>) -> bool + 'static
    {
        self.dynamic_callback = Some(Box::new(callback));
    }

    /// Hand `event` to the subscriber, synchronously
    pub fn dispatch(&mut self, event : &Event) -> i32 {
        debug!("Tracee {:?}: {:?}", self.pid, event);
        match self.event_callback.as_mut() {
            Some(cb) => { cb(event) }
            None => { NO_SUBSCRIBER }
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn debugger(&self) -> &dyn Debugger {
        self.debugger.as_ref()
    }

    /// True once the tracee has completed its exec into the target program
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Wall-clock time the tracee spent running between stops
    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn resource_usage(&self) -> &ResourceUsage {
        &self.usage
    }

    pub fn cpu_time(&self) -> Duration {
        self.usage.cpu_time()
    }

    pub fn max_memory_kb(&self) -> u64 {
        self.usage.max_rss_kb
    }

    /// The reason carried by the `Exited` event, once `monitor` has returned
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason
    }
}
