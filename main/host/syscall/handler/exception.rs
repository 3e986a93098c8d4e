use log::*;
use nix::errno::Errno;

use crate::host::context::ThreadContext;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult, UserPtr};

impl SyscallHandler {
    /// Install a user exception handler, returning the old one through the
    /// out pointer.
    pub fn exception_handler(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let handler_addr = usize::from(args.get(0));
        let old_handler_ptr = UserPtr::from(args.get(1));

        if !ctx.cage.exception_handling_enabled() {
            return Err(Errno::ENOSYS.into());
        }
        if handler_addr != 0 && ctx.cage.mem().user_to_sys(handler_addr.into()).is_err() {
            return Err(Errno::EFAULT.into());
        }

        // attachment of the trusted handler must win against concurrent
        // installs; the stub is consulted before the swap becomes visible
        ctx.runtime
            .debug_stub()
            .ensure_exception_handler_attached(ctx.cage.id().into())?;
        let old = ctx.cage.swap_exception_handler(handler_addr);

        if !old_handler_ptr.is_null() {
            let old = old as u32;
            if let Err(e) = ctx.cage.mem().write_val(old_handler_ptr, &old) {
                // roll back so a bad out pointer doesn't half-install
                ctx.cage.swap_exception_handler(old as usize);
                return Err(e.into());
            }
        }
        debug!(
            "cage {} exception handler {:#x}",
            ctx.cage.id(),
            handler_addr
        );
        Ok(0u32.into())
    }

    pub fn exception_stack(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let stack_addr = usize::from(args.get(0));
        let stack_size = usize::from(args.get(1));

        if !ctx.cage.exception_handling_enabled() {
            return Err(Errno::ENOSYS.into());
        }
        if stack_addr != 0 {
            ctx.cage
                .mem()
                .user_to_sys_range(stack_addr.into(), stack_size)?;
        }
        ctx.cage.set_exception_stack_addr(stack_addr + stack_size);
        Ok(0u32.into())
    }

    pub fn exception_clear_flag(
        &self,
        ctx: &mut ThreadContext,
        _args: &SyscallArgs,
    ) -> SyscallResult {
        if !ctx.cage.exception_handling_enabled() {
            return Err(Errno::ENOSYS.into());
        }
        ctx.thread.set_exception_flag(false);
        Ok(0u32.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::syscall::numbers::*;
    use crate::host::testing::{test_options, Caller};

    fn errno(e: Errno) -> i32 {
        -(e as i32)
    }

    #[test]
    fn test_requires_feature_flag() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        assert_eq!(
            ctx.syscall6(SYS_EXCEPTION_HANDLER, 0usize, 0usize, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::ENOSYS)
        );
        assert_eq!(
            ctx.syscall6(SYS_EXCEPTION_STACK, 0usize, 0usize, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::ENOSYS)
        );
        assert_eq!(
            ctx.syscall6(SYS_EXCEPTION_CLEAR_FLAG, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::ENOSYS)
        );
    }

    #[test]
    fn test_handler_install_and_swap() {
        let mut options = test_options();
        options.enable_exception_handling = true;
        let caller = Caller::new(options);
        let ctx = caller.ctx();

        let first = caller.data_addr(0x100);
        assert_eq!(
            ctx.syscall6(SYS_EXCEPTION_HANDLER, first, 0usize, 0u64, 0u64, 0u64, 0u64),
            0
        );

        // installing a new handler reports the old one
        let old_at = caller.data_addr(0x200);
        let second = caller.data_addr(0x140);
        assert_eq!(
            ctx.syscall6(SYS_EXCEPTION_HANDLER, second, old_at, 0u64, 0u64, 0u64, 0u64),
            0
        );
        let old: u32 = caller.cage.mem().read_val(old_at.into()).unwrap();
        assert_eq!(old as usize, first);
        assert_eq!(caller.cage.exception_handler_addr(), second);
    }

    #[test]
    fn test_exception_stack_and_flag() {
        let mut options = test_options();
        options.enable_exception_handling = true;
        let caller = Caller::new(options);
        let ctx = caller.ctx();

        let stack_at = caller.data_addr(0x4000);
        assert_eq!(
            ctx.syscall6(SYS_EXCEPTION_STACK, stack_at, 0x1000usize, 0u64, 0u64, 0u64, 0u64),
            0
        );
        assert_eq!(caller.cage.exception_stack_addr(), stack_at + 0x1000);

        caller.thread.set_exception_flag(true);
        assert_eq!(
            ctx.syscall6(SYS_EXCEPTION_CLEAR_FLAG, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64),
            0
        );
        assert!(!caller.thread.exception_flag());
    }
}
