//! The dense dispatch table mapping syscall numbers to handlers.

use crate::host::context::ThreadContext;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::numbers::MAX_SYSCALLS;
use crate::host::syscall::types::{SyscallArgs, SyscallError, SyscallResult};

use nix::errno::Errno;

pub type HandlerFn = fn(&SyscallHandler, &mut ThreadContext, &SyscallArgs) -> SyscallResult;

/// A fixed-size table of syscall handlers. Slots without a registered
/// handler report ENOSYS; registering the same number twice is a
/// programming error and panics.
pub struct SyscallTable {
    entries: [Option<HandlerFn>; MAX_SYSCALLS],
}

impl SyscallTable {
    pub fn new() -> Self {
        Self {
            entries: [None; MAX_SYSCALLS],
        }
    }

    pub fn add(&mut self, number: u32, handler: HandlerFn) {
        let slot = self
            .entries
            .get_mut(number as usize)
            .unwrap_or_else(|| panic!("syscall number {} out of range", number));
        if slot.is_some() {
            panic!("duplicate syscall number {}", number);
        }
        *slot = Some(handler);
    }

    pub fn get(&self, number: u32) -> Option<HandlerFn> {
        *self.entries.get(number as usize)?
    }

    pub fn dispatch(
        &self,
        handler: &SyscallHandler,
        ctx: &mut ThreadContext,
        args: &SyscallArgs,
    ) -> SyscallResult {
        match self.get(args.number()) {
            Some(f) => f(handler, ctx, args),
            None => {
                log::debug!("unhandled syscall {}", args.number());
                Err(SyscallError::from(Errno::ENOSYS))
            }
        }
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
