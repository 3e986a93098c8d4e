use log::*;
use nix::errno::Errno;

use crate::host::context::ThreadContext;
use crate::host::descriptor::table::{FdEntry, PipeEnd};
use crate::host::descriptor::DescriptorFlags;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult, UserPtr};

/// O_CLOEXEC of the cage ABI, the only dup3 flag honored.
const DUP3_CLOEXEC: i32 = 0o2000000;

impl SyscallHandler {
    pub fn close(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));

        trace!("Trying to close fd {}", fd);

        let fd: u32 = fd.try_into().map_err(|_| Errno::EBADF)?;

        // detach under the table lock, then let the entry drop outside it
        // so a final file release never runs with the lock held
        let entry = {
            let mut table = ctx.cage.descriptors();
            table.remove(fd).ok_or(Errno::EBADF)?
        };

        if let FdEntry::Pipe { slot, end } = entry {
            ctx.runtime.pipes().close_end(slot, end)?;
        }

        Ok(0u32.into())
    }

    pub fn dup(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let old_fd = i32::from(args.get(0));

        let entry = Self::get_entry(ctx.cage, old_fd)?;
        let entry = match entry {
            FdEntry::Descriptor(desc) => FdEntry::Descriptor(desc.dup(DescriptorFlags::empty())),
            // pipe sentinels duplicate as the same slot reference
            pipe @ FdEntry::Pipe { .. } => pipe,
        };

        let new_fd = ctx.cage.descriptors().add_entry(entry, 0);
        Ok(new_fd.into())
    }

    pub fn dup2(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let old_fd = i32::from(args.get(0));
        let new_fd = i32::from(args.get(1));

        let entry = Self::get_entry(ctx.cage, old_fd)?;

        // dup2 of an fd onto itself does nothing
        if old_fd == new_fd {
            return Ok(new_fd.into());
        }

        let new_fd: u32 = new_fd.try_into().map_err(|_| Errno::EBADF)?;
        let entry = match entry {
            FdEntry::Descriptor(desc) => FdEntry::Descriptor(desc.dup(DescriptorFlags::empty())),
            pipe @ FdEntry::Pipe { .. } => pipe,
        };

        let replaced = ctx.cage.descriptors().set(new_fd, entry);
        if let Some(FdEntry::Pipe { slot, end }) = replaced {
            // errors a close would have reported are lost here
            let _ = ctx.runtime.pipes().close_end(slot, end);
        }

        Ok(new_fd.into())
    }

    pub fn dup3(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let old_fd = i32::from(args.get(0));
        let new_fd = i32::from(args.get(1));
        let flags = i32::from(args.get(2));

        if old_fd == new_fd {
            return Err(Errno::EINVAL.into());
        }

        let desc_flags = match flags {
            0 => DescriptorFlags::empty(),
            DUP3_CLOEXEC => DescriptorFlags::CLOEXEC,
            _ => return Err(Errno::EINVAL.into()),
        };

        let entry = Self::get_entry(ctx.cage, old_fd)?;
        let new_fd: u32 = new_fd.try_into().map_err(|_| Errno::EBADF)?;

        // a target below the high-water mark would shadow a live fd range
        // the allocator still owns
        if new_fd < ctx.cage.descriptors().high_water() {
            return Err(Errno::EBADF.into());
        }

        let entry = match entry {
            FdEntry::Descriptor(desc) => FdEntry::Descriptor(desc.dup(desc_flags)),
            pipe @ FdEntry::Pipe { .. } => pipe,
        };
        let replaced = ctx.cage.descriptors().set(new_fd, entry);
        debug_assert!(replaced.is_none());

        Ok(new_fd.into())
    }

    pub fn read(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let buf_ptr = UserPtr::from(args.get(1));
        let mut count = usize::from(args.get(2));

        let entry = Self::get_entry(ctx.cage, fd)?;

        // anything larger would overflow the return value; clamp rather
        // than fail
        if count > i32::MAX as usize {
            count = i32::MAX as usize;
        }

        ctx.cage
            .mem()
            .user_to_sys_range(buf_ptr, count)
            .map_err(|_| Errno::EFAULT)?;

        let _guard = ctx.cage.io_guard(usize::from(buf_ptr), count);
        let mut bounce = vec![0u8; count];
        let num_read = match entry {
            FdEntry::Pipe { slot, end } => {
                if end != PipeEnd::Read {
                    return Err(Errno::EBADF.into());
                }
                ctx.runtime.pipes().read(slot, &mut bounce)?
            }
            FdEntry::Descriptor(desc) => desc.file().read(&mut bounce)?,
        };
        ctx.cage.mem().copy_to_user(buf_ptr, &bounce[..num_read])?;

        trace!("read returned {} bytes", num_read);
        Ok(num_read.into())
    }

    pub fn write(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let buf_ptr = UserPtr::from(args.get(1));
        let mut count = usize::from(args.get(2));

        let entry = Self::get_entry(ctx.cage, fd)?;

        if count > i32::MAX as usize {
            count = i32::MAX as usize;
        }

        let _guard = ctx.cage.io_guard(usize::from(buf_ptr), count);
        let mut bounce = vec![0u8; count];
        ctx.cage.mem().copy_from_user(&mut bounce, buf_ptr)?;

        let num_written = match entry {
            FdEntry::Pipe { slot, end } => {
                if end != PipeEnd::Write {
                    return Err(Errno::EBADF.into());
                }
                ctx.runtime.pipes().write(slot, &bounce)?
            }
            FdEntry::Descriptor(desc) => desc.file().write(&bounce)?,
        };

        trace!("write returned {} bytes", num_written);
        Ok(num_written.into())
    }

    /// 64-bit offsets travel through an in/out user pointer; the syscall
    /// value itself is just success or failure.
    pub fn lseek(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let offset_ptr = UserPtr::from(args.get(1));
        let whence = i32::from(args.get(2));

        let file = Self::get_file(ctx.cage, fd)?;
        let offset: i64 = ctx.cage.mem().read_val(offset_ptr)?;
        let whence = whence.try_into()?;

        let new_offset = file.seek(offset, whence)?;
        if ctx.cage.mem().write_val(offset_ptr, &new_offset).is_err() {
            // the pointer was validated by the copy-in; losing it now is
            // runtime breakage, not a caller error
            panic!("lseek: in/out pointer became invalid at copyout");
        }
        Ok(0u32.into())
    }

    pub fn getdents(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let buf_ptr = UserPtr::from(args.get(1));
        let count = usize::from(args.get(2));

        let file = Self::get_file(ctx.cage, fd)?;
        ctx.cage.mem().user_to_sys_range(buf_ptr, count)?;

        let mut bounce = vec![0u8; count];
        let num = file.getdents(&mut bounce)?;
        ctx.cage.mem().copy_to_user(buf_ptr, &bounce[..num])?;
        Ok(num.into())
    }

    /// Allocate a pipe slot and hand back its two sentinel fds.
    pub fn pipe(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let out_ptr = UserPtr::from(args.get(0));

        if out_ptr.is_null() {
            return Err(Errno::EFAULT.into());
        }
        ctx.cage
            .mem()
            .user_to_sys_range(out_ptr, 2 * std::mem::size_of::<u32>())?;

        let slot = ctx.runtime.pipes().allocate()?;
        let read_fd = FdEntry::pipe_fd(slot, PipeEnd::Read);
        let write_fd = FdEntry::pipe_fd(slot, PipeEnd::Write);
        {
            let mut table = ctx.cage.descriptors();
            table.set(
                read_fd,
                FdEntry::Pipe {
                    slot,
                    end: PipeEnd::Read,
                },
            );
            table.set(
                write_fd,
                FdEntry::Pipe {
                    slot,
                    end: PipeEnd::Write,
                },
            );
        }

        let fds = [read_fd, write_fd];
        if let Err(e) = ctx.cage.mem().write_val(out_ptr, &fds) {
            let mut table = ctx.cage.descriptors();
            table.remove(read_fd);
            table.remove(write_fd);
            let _ = ctx.runtime.pipes().close_end(slot, PipeEnd::Read);
            let _ = ctx.runtime.pipes().close_end(slot, PipeEnd::Write);
            return Err(e.into());
        }
        debug!(
            "cage {} gets pipe slot {} as fds {}/{}",
            ctx.cage.id(),
            slot,
            read_fd,
            write_fd
        );
        Ok(0u32.into())
    }

    /// The calling cage's id. (Not the host pid: cages don't get to learn
    /// that.)
    pub fn getpid(&self, ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        Ok(u32::from(ctx.cage.id()).into())
    }
}
