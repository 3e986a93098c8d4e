//! A cage thread: the user execution context carried by one host thread.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use crate::host::cage::CageId;

/// The captured user-mode register state of a thread. Pointer-typed fields
/// are window-relative user addresses.
#[derive(Clone, Debug, Default)]
pub struct UserContext {
    pub prog_ctr: usize,
    pub stack_ptr: usize,
    pub frame_ptr: usize,
    /// First thread-local storage slot, set by tls_init.
    pub tls1: usize,
    /// Second thread-local storage slot.
    pub tls2: usize,
    /// The register a completed syscall's value is delivered in.
    pub sysret: u64,
    /// The primary return register.
    pub ret: u64,
    pub callee_saved: [u64; 6],
}

impl UserContext {
    /// The context a fork child starts from: the parent's registers with
    /// both return registers showing zero.
    pub fn for_fork_child(parent: &UserContext) -> Self {
        let mut ctx = parent.clone();
        ctx.sysret = 0;
        ctx.ret = 0;
        ctx
    }
}

/// Where a thread currently executes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SuspendState {
    /// Running runtime code.
    Trusted,
    /// Running module code.
    Untrusted,
    Suspended,
}

/// Trusted state for one thread of a cage.
pub struct CageThread {
    cage_id: CageId,
    thread_num: usize,
    /// Slot in the runtime's global thread table.
    tls_index: usize,
    user_ctx: Mutex<UserContext>,
    suspend_state: Mutex<SuspendState>,
    suspended_registers: Mutex<Option<UserContext>>,
    fault_signal: AtomicI32,
    exception_flag: AtomicBool,
    // registered while the host thread runs; the exception path needs it
    signal_stack: Mutex<Option<Vec<u8>>>,
}

/// Size of the per-thread signal stack.
const SIGNAL_STACK_SIZE: usize = 64 * 1024;

impl CageThread {
    pub fn new(cage_id: CageId, thread_num: usize, tls_index: usize) -> Self {
        Self {
            cage_id,
            thread_num,
            tls_index,
            user_ctx: Mutex::new(UserContext::default()),
            suspend_state: Mutex::new(SuspendState::Trusted),
            suspended_registers: Mutex::new(None),
            fault_signal: AtomicI32::new(0),
            exception_flag: AtomicBool::new(false),
            signal_stack: Mutex::new(None),
        }
    }

    pub fn cage_id(&self) -> CageId {
        self.cage_id
    }

    pub fn thread_num(&self) -> usize {
        self.thread_num
    }

    pub fn tls_index(&self) -> usize {
        self.tls_index
    }

    pub fn user_ctx(&self) -> UserContext {
        self.user_ctx.lock().unwrap().clone()
    }

    pub fn set_user_ctx(&self, ctx: UserContext) {
        *self.user_ctx.lock().unwrap() = ctx;
    }

    pub fn with_user_ctx<T>(&self, f: impl FnOnce(&mut UserContext) -> T) -> T {
        f(&mut self.user_ctx.lock().unwrap())
    }

    pub fn suspend_state(&self) -> SuspendState {
        *self.suspend_state.lock().unwrap()
    }

    pub fn set_suspend_state(&self, state: SuspendState) {
        *self.suspend_state.lock().unwrap() = state;
    }

    /// Park a register snapshot for the suspension machinery.
    pub fn set_suspended_registers(&self, regs: Option<UserContext>) {
        *self.suspended_registers.lock().unwrap() = regs;
    }

    pub fn suspended_registers(&self) -> Option<UserContext> {
        self.suspended_registers.lock().unwrap().clone()
    }

    pub fn fault_signal(&self) -> i32 {
        self.fault_signal.load(Ordering::Relaxed)
    }

    pub fn set_fault_signal(&self, sig: i32) {
        self.fault_signal.store(sig, Ordering::Relaxed);
    }

    pub fn exception_flag(&self) -> bool {
        self.exception_flag.load(Ordering::Acquire)
    }

    pub fn set_exception_flag(&self, value: bool) {
        self.exception_flag.store(value, Ordering::Release);
    }

    /// Allocate and register the signal stack. Runs on the host thread
    /// before the switch to untrusted execution.
    pub fn register_signal_stack(&self) {
        let mut stack = self.signal_stack.lock().unwrap();
        debug_assert!(stack.is_none());
        *stack = Some(vec![0u8; SIGNAL_STACK_SIZE]);
    }

    /// Unregister the signal stack; the last step before the host thread
    /// exits.
    pub fn unregister_signal_stack(&self) {
        *self.signal_stack.lock().unwrap() = None;
    }
}

impl std::fmt::Debug for CageThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CageThread(cage: {}, num: {}, tls: {})",
            self.cage_id, self.thread_num, self.tls_index
        )
    }
}
