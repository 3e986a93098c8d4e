use nix::errno::Errno;

use crate::host::cage::Cage;
use crate::host::context::ThreadContext;
use crate::host::descriptor::table::FdEntry;
use crate::host::descriptor::{Descriptor, FileHandle};
use crate::host::syscall::numbers::*;
use crate::host::syscall::table::SyscallTable;
use crate::host::syscall::types::{SyscallArgs, SyscallResult};

mod exception;
mod file;
mod imc;
mod mman;
mod process;
mod sync;
mod thread;
mod time;
mod unistd;

pub struct SyscallHandler {
    // Will contain handler state once any of it needs a home beyond the
    // runtime itself.
}

impl SyscallHandler {
    pub fn new() -> SyscallHandler {
        SyscallHandler {}
    }

    pub fn null(&self, _ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        Ok(0u32.into())
    }

    /// Internal helper that returns the table entry for the fd if it
    /// exists, otherwise returns EBADF.
    fn get_entry(cage: &Cage, fd: impl TryInto<u32>) -> Result<FdEntry, Errno> {
        // check that fd is within bounds
        let fd: u32 = fd.try_into().map_err(|_| Errno::EBADF)?;
        cage.descriptors().get(fd).cloned().ok_or(Errno::EBADF)
    }

    /// Internal helper for operations that only make sense on ordinary
    /// descriptors; a pipe sentinel is not one.
    fn get_descriptor(cage: &Cage, fd: impl TryInto<u32>) -> Result<Descriptor, Errno> {
        match Self::get_entry(cage, fd)? {
            FdEntry::Descriptor(desc) => Ok(desc),
            FdEntry::Pipe { .. } => Err(Errno::EBADF),
        }
    }

    fn get_file(cage: &Cage, fd: impl TryInto<u32>) -> Result<FileHandle, Errno> {
        Ok(Self::get_descriptor(cage, fd)?.into_file())
    }
}

impl Default for SyscallHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Populate the dispatch table. Called once at runtime construction;
/// registering a number twice panics.
pub fn register_all(table: &mut SyscallTable) {
    table.add(SYS_NULL, SyscallHandler::null);
    table.add(SYS_NAME_SERVICE, SyscallHandler::name_service);
    table.add(SYS_DUP, SyscallHandler::dup);
    table.add(SYS_DUP2, SyscallHandler::dup2);
    table.add(SYS_DUP3, SyscallHandler::dup3);
    table.add(SYS_OPEN, SyscallHandler::open);
    table.add(SYS_CLOSE, SyscallHandler::close);
    table.add(SYS_READ, SyscallHandler::read);
    table.add(SYS_WRITE, SyscallHandler::write);
    table.add(SYS_LSEEK, SyscallHandler::lseek);
    table.add(SYS_IOCTL, SyscallHandler::ioctl);
    table.add(SYS_STAT, SyscallHandler::stat);
    table.add(SYS_FSTAT, SyscallHandler::fstat);
    table.add(SYS_GETDENTS, SyscallHandler::getdents);
    table.add(SYS_BRK, SyscallHandler::brk);
    table.add(SYS_MMAP, SyscallHandler::mmap);
    table.add(SYS_MUNMAP, SyscallHandler::munmap);
    table.add(SYS_MPROTECT, SyscallHandler::mprotect);
    table.add(SYS_EXIT, SyscallHandler::exit);
    table.add(SYS_GETPID, SyscallHandler::getpid);
    table.add(SYS_SCHED_YIELD, SyscallHandler::sched_yield);
    table.add(SYS_GETTIMEOFDAY, SyscallHandler::gettimeofday);
    table.add(SYS_NANOSLEEP, SyscallHandler::nanosleep);
    table.add(SYS_CLOCK_GETRES, SyscallHandler::clock_getres);
    table.add(SYS_CLOCK_GETTIME, SyscallHandler::clock_gettime);
    table.add(SYS_MKDIR, SyscallHandler::mkdir);
    table.add(SYS_RMDIR, SyscallHandler::rmdir);
    table.add(SYS_CHDIR, SyscallHandler::chdir);
    table.add(SYS_GETCWD, SyscallHandler::getcwd);
    table.add(SYS_UNLINK, SyscallHandler::unlink);
    table.add(SYS_IMC_MAKEBOUNDSOCK, SyscallHandler::imc_makeboundsock);
    table.add(SYS_IMC_ACCEPT, SyscallHandler::imc_accept);
    table.add(SYS_IMC_CONNECT, SyscallHandler::imc_connect);
    table.add(SYS_IMC_SENDMSG, SyscallHandler::imc_sendmsg);
    table.add(SYS_IMC_RECVMSG, SyscallHandler::imc_recvmsg);
    table.add(SYS_IMC_MEM_OBJ_CREATE, SyscallHandler::imc_mem_obj_create);
    table.add(SYS_IMC_SOCKETPAIR, SyscallHandler::imc_socketpair);
    table.add(SYS_MUTEX_CREATE, SyscallHandler::mutex_create);
    table.add(SYS_MUTEX_LOCK, SyscallHandler::mutex_lock);
    table.add(SYS_MUTEX_TRYLOCK, SyscallHandler::mutex_trylock);
    table.add(SYS_MUTEX_UNLOCK, SyscallHandler::mutex_unlock);
    table.add(SYS_COND_CREATE, SyscallHandler::cond_create);
    table.add(SYS_COND_WAIT, SyscallHandler::cond_wait);
    table.add(SYS_COND_SIGNAL, SyscallHandler::cond_signal);
    table.add(SYS_COND_BROADCAST, SyscallHandler::cond_broadcast);
    table.add(SYS_COND_TIMED_WAIT_ABS, SyscallHandler::cond_timed_wait_abs);
    table.add(SYS_THREAD_CREATE, SyscallHandler::thread_create);
    table.add(SYS_THREAD_EXIT, SyscallHandler::thread_exit);
    table.add(SYS_TLS_INIT, SyscallHandler::tls_init);
    table.add(SYS_THREAD_NICE, SyscallHandler::thread_nice);
    table.add(SYS_TLS_GET, SyscallHandler::tls_get);
    table.add(SYS_SECOND_TLS_SET, SyscallHandler::second_tls_set);
    table.add(SYS_SECOND_TLS_GET, SyscallHandler::second_tls_get);
    table.add(SYS_SEM_CREATE, SyscallHandler::sem_create);
    table.add(SYS_SEM_WAIT, SyscallHandler::sem_wait);
    table.add(SYS_SEM_POST, SyscallHandler::sem_post);
    table.add(SYS_SEM_GET_VALUE, SyscallHandler::sem_get_value);
    table.add(SYS_EXCEPTION_HANDLER, SyscallHandler::exception_handler);
    table.add(SYS_EXCEPTION_STACK, SyscallHandler::exception_stack);
    table.add(SYS_EXCEPTION_CLEAR_FLAG, SyscallHandler::exception_clear_flag);
    table.add(SYS_FORK, SyscallHandler::fork);
    table.add(SYS_EXECVE, SyscallHandler::execve);
    table.add(SYS_EXECV, SyscallHandler::execv);
    table.add(SYS_WAITPID, SyscallHandler::waitpid);
    table.add(SYS_WAIT, SyscallHandler::wait);
    table.add(SYS_PIPE, SyscallHandler::pipe);
}
