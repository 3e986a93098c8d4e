//! Everything a syscall handler needs to know about its caller.

use std::sync::Arc;

use crate::host::cage::Cage;
use crate::host::runtime::Runtime;
use crate::host::syscall::types::{SyscallArgs, SyscallReg};
use crate::host::thread::CageThread;

/// The caller of the current operation: runtime, cage, and thread. Handed
/// to every syscall handler and to module entry bodies.
pub struct ThreadContext<'a> {
    pub runtime: &'a Arc<Runtime>,
    pub cage: &'a Arc<Cage>,
    pub thread: &'a Arc<CageThread>,
}

impl<'a> ThreadContext<'a> {
    pub fn new(
        runtime: &'a Arc<Runtime>,
        cage: &'a Arc<Cage>,
        thread: &'a Arc<CageThread>,
    ) -> Self {
        Self {
            runtime,
            cage,
            thread,
        }
    }

    /// Trap into the broker. This is the module-side entry point: the
    /// value returned is exactly what untrusted code would see in its
    /// syscall-return register.
    pub fn syscall(&self, number: u32, args: [SyscallReg; 6]) -> i32 {
        self.runtime
            .handle_syscall(self, &SyscallArgs::new(number, args))
    }

    /// Convenience for the common haul of small scalar arguments.
    pub fn syscall6(
        &self,
        number: u32,
        a: impl Into<SyscallReg>,
        b: impl Into<SyscallReg>,
        c: impl Into<SyscallReg>,
        d: impl Into<SyscallReg>,
        e: impl Into<SyscallReg>,
        f: impl Into<SyscallReg>,
    ) -> i32 {
        self.syscall(
            number,
            [a.into(), b.into(), c.into(), d.into(), e.into(), f.into()],
        )
    }
}
