use log::*;
use nix::errno::Errno;

use crate::host::cage::ForkState;
use crate::host::context::ThreadContext;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult, UserPtr};
use crate::host::thread::UserContext;

/// Jump targets must sit on a bundle boundary.
const BUNDLE_ALIGN: usize = 32;
/// ABI alignment applied to a new thread's stack pointer.
const STACK_ALIGN: usize = 16;

impl SyscallHandler {
    pub fn thread_create(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let entry = usize::from(args.get(0));
        let stack_ptr = usize::from(args.get(1));
        let tls1 = usize::from(args.get(2));
        let tls2 = usize::from(args.get(3));

        // the entry must be a valid jump target inside the text the
        // validator approved
        if entry % BUNDLE_ALIGN != 0 || !ctx.cage.range_in_dynamic_text(entry, BUNDLE_ALIGN) {
            debug!("thread_create: bad entry address {:#x}", entry);
            return Err(Errno::EFAULT.into());
        }
        ctx.cage.mem().user_to_sys(stack_ptr.into())?;

        // a fork snapshot of this cage must not see a thread half-born
        if ctx.cage.fork_state() == ForkState::Forking {
            return Err(Errno::EAGAIN.into());
        }

        let module = ctx.cage.module().ok_or(Errno::EINVAL)?;

        // don't let the new stack land in a transient unmapping
        ctx.cage.wait_no_vm_hole();

        let user_ctx = UserContext {
            prog_ctr: entry,
            stack_ptr: stack_ptr & !(STACK_ALIGN - 1),
            tls1,
            tls2,
            ..Default::default()
        };
        let entry = module.thread_entry(user_ctx.clone());
        ctx.runtime
            .launch_thread(ctx.cage, entry, Some(user_ctx))?;
        Ok(0u32.into())
    }

    pub fn thread_exit(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let stack_flag_ptr = UserPtr::from(args.get(0));

        if !stack_flag_ptr.is_null() {
            let zero: u32 = 0;
            if ctx.cage.mem().write_val(stack_flag_ptr, &zero).is_err() {
                debug!(
                    "thread_exit: ignoring invalid stack_flag {:p}",
                    stack_flag_ptr
                );
            }
        }
        // teardown runs when the body unwinds back into the launcher
        Ok(0u32.into())
    }

    pub fn tls_init(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let thread_ptr = usize::from(args.get(0));

        ctx.cage.mem().user_to_sys(thread_ptr.into())?;
        ctx.thread.with_user_ctx(|user| user.tls1 = thread_ptr);
        Ok(0u32.into())
    }

    pub fn tls_get(&self, ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        Ok(ctx.thread.with_user_ctx(|user| user.tls1).into())
    }

    pub fn second_tls_set(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let thread_ptr = usize::from(args.get(0));

        ctx.cage.mem().user_to_sys(thread_ptr.into())?;
        ctx.thread.with_user_ctx(|user| user.tls2 = thread_ptr);
        Ok(0u32.into())
    }

    pub fn second_tls_get(&self, ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        Ok(ctx.thread.with_user_ctx(|user| user.tls2).into())
    }

    pub fn thread_nice(&self, _ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let nice = i32::from(args.get(0));
        // scheduling hints are accepted and ignored
        trace!("thread_nice({})", nice);
        Ok(0u32.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::syscall::numbers::*;
    use crate::host::testing::{test_options, Caller, TestModule};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn errno(e: Errno) -> i32 {
        -(e as i32)
    }

    #[test]
    fn test_tls_slots() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();

        let tls_at = caller.data_addr(0x100);
        assert_eq!(ctx.syscall6(SYS_TLS_INIT, tls_at, 0u64, 0u64, 0u64, 0u64, 0u64), 0);
        assert_eq!(
            ctx.syscall6(SYS_TLS_GET, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64) as usize,
            tls_at
        );

        let second_at = caller.data_addr(0x200);
        assert_eq!(
            ctx.syscall6(SYS_SECOND_TLS_SET, second_at, 0u64, 0u64, 0u64, 0u64, 0u64),
            0
        );
        assert_eq!(
            ctx.syscall6(SYS_SECOND_TLS_GET, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64) as usize,
            second_at
        );

        // out-of-window thread pointer
        assert_eq!(
            ctx.syscall6(
                SYS_TLS_INIT,
                caller.cage.mem().size(),
                0u64,
                0u64,
                0u64,
                0u64,
                0u64
            ),
            errno(Errno::EFAULT)
        );
    }

    #[test]
    fn test_thread_exit_writes_stack_flag() {
        let caller = Caller::new(test_options());
        let flag_at = caller.data_addr(0x100);
        caller.cage.mem().write_val(flag_at.into(), &1u32).unwrap();
        assert_eq!(
            caller
                .ctx()
                .syscall6(SYS_THREAD_EXIT, flag_at, 0u64, 0u64, 0u64, 0u64, 0u64),
            0
        );
        let flag: u32 = caller.cage.mem().read_val(flag_at.into()).unwrap();
        assert_eq!(flag, 0);
    }

    #[test]
    fn test_thread_create_validates_entry() {
        let caller = Caller::new(test_options());
        caller.cage.set_dynamic_text(0x100000..0x120000);
        let ctx = caller.ctx();
        let sp = caller.data_addr(0x8000);

        // outside the dynamic-text region
        assert_eq!(
            ctx.syscall6(SYS_THREAD_CREATE, 0x20000usize, sp, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EFAULT)
        );
        // misaligned
        assert_eq!(
            ctx.syscall6(SYS_THREAD_CREATE, 0x100010usize, sp, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EFAULT)
        );
    }

    #[test]
    fn test_thread_create_refused_during_fork() {
        let caller = Caller::new(test_options());
        caller.cage.set_dynamic_text(0x100000..0x120000);
        let ctx = caller.ctx();
        let (entry, sp) = (0x100040usize, caller.data_addr(0x8000));

        caller.cage.begin_fork().unwrap();
        assert_eq!(
            ctx.syscall6(SYS_THREAD_CREATE, entry, sp, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EAGAIN)
        );
        caller.cage.end_fork();
        // with the fork over the gate lifts; the next refusal is the
        // missing module, not the fork state
        assert_eq!(
            ctx.syscall6(SYS_THREAD_CREATE, entry, sp, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EINVAL)
        );
    }

    #[test]
    fn test_thread_create_runs_thread_body() {
        let caller = Caller::new(test_options());
        caller.cage.set_dynamic_text(0x100000..0x120000);

        let seen: Arc<Mutex<Option<UserContext>>> = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&seen);
        caller.cage.set_module(Arc::new(
            TestModule::new(|_, _| 0).with_thread(move |_ctx, user_ctx| {
                *recorded.lock().unwrap() = Some(user_ctx);
                0
            }),
        ));

        let entry = 0x100040usize;
        let sp = caller.data_addr(0x8008);
        let tls = caller.data_addr(0x9000);
        assert_eq!(
            caller
                .ctx()
                .syscall6(SYS_THREAD_CREATE, entry, sp, tls, 0u64, 0u64, 0u64),
            0
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(user_ctx) = seen.lock().unwrap().clone() {
                assert_eq!(user_ctx.prog_ctr, entry);
                // the stack pointer was aligned down
                assert_eq!(user_ctx.stack_ptr, sp & !15);
                assert_eq!(user_ctx.tls1, tls);
                break;
            }
            assert!(Instant::now() < deadline, "thread body never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
