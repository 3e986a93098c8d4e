use std::sync::Arc;
use std::time::Duration;

use crate::host::context::ThreadContext;
use crate::host::descriptor::{
    CondvarFile, Descriptor, FileHandle, MutexFile, SemaphoreFile,
};
use crate::host::syscall::handler::time::AbiTimespec;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult, UserPtr};

impl SyscallHandler {
    pub fn mutex_create(&self, ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        let handle = FileHandle::Mutex(Arc::new(MutexFile::new()));
        let fd = ctx.cage.descriptors().add(Descriptor::new(handle), 0);
        Ok(fd.into())
    }

    pub fn mutex_lock(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        file.as_mutex()?.lock()?;
        Ok(0u32.into())
    }

    pub fn mutex_unlock(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        file.as_mutex()?.unlock()?;
        Ok(0u32.into())
    }

    pub fn mutex_trylock(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        file.as_mutex()?.try_lock()?;
        Ok(0u32.into())
    }

    pub fn cond_create(&self, ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        let handle = FileHandle::Condvar(Arc::new(CondvarFile::new()));
        let fd = ctx.cage.descriptors().add(Descriptor::new(handle), 0);
        Ok(fd.into())
    }

    pub fn cond_wait(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let cond_fd = i32::from(args.get(0));
        let mutex_fd = i32::from(args.get(1));

        let cond = Self::get_file(ctx.cage, cond_fd)?;
        let mutex = Self::get_file(ctx.cage, mutex_fd)?;
        cond.as_condvar()?.wait(mutex.as_mutex()?)?;
        Ok(0u32.into())
    }

    pub fn cond_signal(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        file.as_condvar()?.signal()?;
        Ok(0u32.into())
    }

    pub fn cond_broadcast(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        file.as_condvar()?.broadcast()?;
        Ok(0u32.into())
    }

    /// Wait with an absolute deadline, copied in before blocking.
    pub fn cond_timed_wait_abs(
        &self,
        ctx: &mut ThreadContext,
        args: &SyscallArgs,
    ) -> SyscallResult {
        let cond_fd = i32::from(args.get(0));
        let mutex_fd = i32::from(args.get(1));
        let deadline_ptr = UserPtr::from(args.get(2));

        let deadline: AbiTimespec = ctx.cage.mem().read_val(deadline_ptr)?;
        let deadline = Duration::try_from(deadline)?;

        let cond = Self::get_file(ctx.cage, cond_fd)?;
        let mutex = Self::get_file(ctx.cage, mutex_fd)?;
        cond.as_condvar()?.timed_wait_abs(mutex.as_mutex()?, deadline)?;
        Ok(0u32.into())
    }

    pub fn sem_create(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let init_value = u32::from(args.get(0));
        let handle = FileHandle::Semaphore(Arc::new(SemaphoreFile::new(init_value)?));
        let fd = ctx.cage.descriptors().add(Descriptor::new(handle), 0);
        Ok(fd.into())
    }

    pub fn sem_wait(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        file.as_semaphore()?.wait()?;
        Ok(0u32.into())
    }

    pub fn sem_post(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        file.as_semaphore()?.post()?;
        Ok(0u32.into())
    }

    pub fn sem_get_value(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let file = Self::get_file(ctx.cage, fd)?;
        Ok(file.as_semaphore()?.get_value().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::syscall::numbers::*;
    use crate::host::testing::{test_options, Caller};
    use nix::errno::Errno;
    use std::time::SystemTime;

    fn errno(e: Errno) -> i32 {
        -(e as i32)
    }

    #[test]
    fn test_mutex_syscalls() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();

        let fd = ctx.syscall6(SYS_MUTEX_CREATE, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(fd >= 3);
        assert_eq!(ctx.syscall6(SYS_MUTEX_LOCK, fd, 0u64, 0u64, 0u64, 0u64, 0u64), 0);
        assert_eq!(
            ctx.syscall6(SYS_MUTEX_TRYLOCK, fd, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EBUSY)
        );
        assert_eq!(ctx.syscall6(SYS_MUTEX_UNLOCK, fd, 0u64, 0u64, 0u64, 0u64, 0u64), 0);
        assert_eq!(ctx.syscall6(SYS_MUTEX_TRYLOCK, fd, 0u64, 0u64, 0u64, 0u64, 0u64), 0);

        // the capability surface is per kind
        assert_eq!(
            ctx.syscall6(SYS_COND_SIGNAL, fd, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EINVAL)
        );
    }

    #[test]
    fn test_cond_timed_wait_abs_expires() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();

        let mutex_fd = ctx.syscall6(SYS_MUTEX_CREATE, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64);
        let cond_fd = ctx.syscall6(SYS_COND_CREATE, 0u64, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert_eq!(ctx.syscall6(SYS_MUTEX_LOCK, mutex_fd, 0u64, 0u64, 0u64, 0u64, 0u64), 0);

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap();
        let deadline = AbiTimespec::from(now + Duration::from_millis(30));
        let deadline_at = caller.data_addr(0x100);
        caller.cage.mem().write_val(deadline_at.into(), &deadline).unwrap();

        assert_eq!(
            ctx.syscall6(
                SYS_COND_TIMED_WAIT_ABS,
                cond_fd,
                mutex_fd,
                deadline_at,
                0u64,
                0u64,
                0u64
            ),
            errno(Errno::ETIMEDOUT)
        );
        // the mutex came back locked
        assert_eq!(
            ctx.syscall6(SYS_MUTEX_TRYLOCK, mutex_fd, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EBUSY)
        );
    }

    #[test]
    fn test_semaphore_syscalls() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();

        let fd = ctx.syscall6(SYS_SEM_CREATE, 2u32, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(fd >= 3);
        assert_eq!(ctx.syscall6(SYS_SEM_GET_VALUE, fd, 0u64, 0u64, 0u64, 0u64, 0u64), 2);
        assert_eq!(ctx.syscall6(SYS_SEM_WAIT, fd, 0u64, 0u64, 0u64, 0u64, 0u64), 0);
        assert_eq!(ctx.syscall6(SYS_SEM_POST, fd, 0u64, 0u64, 0u64, 0u64, 0u64), 0);
        assert_eq!(ctx.syscall6(SYS_SEM_GET_VALUE, fd, 0u64, 0u64, 0u64, 0u64, 0u64), 2);

        assert_eq!(
            ctx.syscall6(SYS_SEM_CREATE, u32::MAX, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EINVAL)
        );
    }
}
