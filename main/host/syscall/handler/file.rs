use std::path::{Path, PathBuf};

use log::*;
use nix::errno::Errno;

use crate::host::context::ThreadContext;
use crate::host::descriptor::host_io::{stat_path, HostIoFile, OpenFlags};
use crate::host::descriptor::{Descriptor, FileHandle, PATH_MAX};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult, UserPtr};

impl SyscallHandler {
    // Is the cage authorized to touch the host filesystem at all? The only
    // policy currently implemented is the all-or-nothing bypass switch.
    fn acl_check(ctx: &ThreadContext, path: &Path) -> Result<(), Errno> {
        if ctx.runtime.options().bypass_acl {
            return Ok(());
        }
        debug!(
            "cage {} denied host filesystem access to {:?}",
            ctx.cage.id(),
            path
        );
        Err(Errno::EACCES)
    }

    // Copy a path out of the cage and resolve it against the cage's
    // working directory.
    fn copy_path(ctx: &ThreadContext, ptr: UserPtr) -> Result<PathBuf, Errno> {
        let path = ctx.cage.mem().copy_path_from_user(ptr, PATH_MAX)?;
        let path = PathBuf::from(path);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(ctx.cage.cwd().join(path))
        }
    }

    pub fn open(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));
        let flags = u32::from(args.get(1));
        let mode = u32::from(args.get(2));

        let path = Self::copy_path(ctx, path_ptr)?;
        Self::acl_check(ctx, &path)?;

        let flags = OpenFlags::from_bits(flags).ok_or(Errno::EINVAL)?;
        let file = HostIoFile::open(&path, flags, mode)?;
        let handle = FileHandle::HostIo(std::sync::Arc::new(atomic_refcell::AtomicRefCell::new(
            file,
        )));
        let fd = ctx.cage.descriptors().add(Descriptor::new(handle), 0);
        debug!("cage {} opened {:?} as fd {}", ctx.cage.id(), path, fd);
        Ok(fd.into())
    }

    pub fn stat(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));
        let stat_ptr = UserPtr::from(args.get(1));

        let path = Self::copy_path(ctx, path_ptr)?;
        Self::acl_check(ctx, &path)?;

        let stat = stat_path(&path)?;
        ctx.cage.mem().write_val(stat_ptr, &stat)?;
        Ok(0u32.into())
    }

    pub fn fstat(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let stat_ptr = UserPtr::from(args.get(1));

        let file = Self::get_file(ctx.cage, fd)?;
        let stat = file.stat()?;
        ctx.cage.mem().write_val(stat_ptr, &stat)?;
        Ok(0u32.into())
    }

    pub fn mkdir(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));
        let _mode = u32::from(args.get(1));

        let path = Self::copy_path(ctx, path_ptr)?;
        Self::acl_check(ctx, &path)?;

        std::fs::create_dir(&path).map_err(crate::host::syscall::types::SyscallError::from)?;
        Ok(0u32.into())
    }

    pub fn rmdir(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));

        let path = Self::copy_path(ctx, path_ptr)?;
        Self::acl_check(ctx, &path)?;

        std::fs::remove_dir(&path).map_err(crate::host::syscall::types::SyscallError::from)?;
        Ok(0u32.into())
    }

    pub fn unlink(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));

        let path = Self::copy_path(ctx, path_ptr)?;
        Self::acl_check(ctx, &path)?;

        std::fs::remove_file(&path).map_err(crate::host::syscall::types::SyscallError::from)?;
        Ok(0u32.into())
    }

    pub fn chdir(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));

        let path = Self::copy_path(ctx, path_ptr)?;
        Self::acl_check(ctx, &path)?;

        let md = std::fs::metadata(&path).map_err(|_| Errno::ENOENT)?;
        if !md.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        ctx.cage.set_cwd(path);
        Ok(0u32.into())
    }

    pub fn getcwd(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let buf_ptr = UserPtr::from(args.get(0));
        let size = usize::from(args.get(1));

        let cwd = ctx.cage.cwd();
        let bytes = cwd.to_string_lossy().into_owned().into_bytes();
        if bytes.len() + 1 > size {
            return Err(Errno::ERANGE.into());
        }
        ctx.cage.mem().copy_to_user(buf_ptr, &bytes)?;
        ctx.cage.mem().copy_to_user(buf_ptr.add(bytes.len()), &[0])?;
        Ok(0u32.into())
    }

    /// Device control needs the bypass switch like any other host access,
    /// then defers to the descriptor.
    pub fn ioctl(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let request = u64::from(args.get(1));

        let file = Self::get_file(ctx.cage, fd)?;
        if !ctx.runtime.options().bypass_acl {
            return Err(Errno::EINVAL.into());
        }
        let rv = file.ioctl(request)?;
        Ok(rv.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::descriptor::AbiStat;
    use crate::host::syscall::numbers::*;
    use crate::host::testing::{test_options, Caller};

    fn errno(e: Errno) -> i32 {
        -(e as i32)
    }

    fn put_cstr(caller: &Caller, offset: usize, s: &str) -> usize {
        let at = caller.data_addr(offset);
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        caller.cage.mem().copy_to_user(at.into(), &bytes).unwrap();
        at
    }

    #[test]
    fn test_acl_gate() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("x");
        std::fs::write(&file_path, b"data").unwrap();

        // with the gate closed every path operation is refused
        let caller = Caller::new(test_options());
        let path_at = put_cstr(&caller, 0, file_path.to_str().unwrap());
        assert_eq!(
            caller.ctx().syscall6(SYS_OPEN, path_at, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EACCES)
        );
        let stat_at = caller.data_addr(0x1000);
        assert_eq!(
            caller.ctx().syscall6(SYS_STAT, path_at, stat_at, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EACCES)
        );

        // with the bypass switch, open succeeds with a fresh cage fd
        let mut options = test_options();
        options.bypass_acl = true;
        let caller = Caller::new(options);
        let path_at = put_cstr(&caller, 0, file_path.to_str().unwrap());
        let fd = caller.ctx().syscall6(SYS_OPEN, path_at, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(fd >= 3);
    }

    #[test]
    fn test_stat_and_fstat() {
        let mut options = test_options();
        options.bypass_acl = true;
        let caller = Caller::new(options);
        let ctx = caller.ctx();

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("f");
        std::fs::write(&file_path, b"0123456").unwrap();

        let path_at = put_cstr(&caller, 0, file_path.to_str().unwrap());
        let stat_at = caller.data_addr(0x1000);
        assert_eq!(ctx.syscall6(SYS_STAT, path_at, stat_at, 0u64, 0u64, 0u64, 0u64), 0);
        let stat: AbiStat = caller.cage.mem().read_val(stat_at.into()).unwrap();
        assert_eq!(stat.size, 7);

        let fd = ctx.syscall6(SYS_OPEN, path_at, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(fd >= 0);
        let fstat_at = caller.data_addr(0x2000);
        assert_eq!(ctx.syscall6(SYS_FSTAT, fd, fstat_at, 0u64, 0u64, 0u64, 0u64), 0);
        let fstat: AbiStat = caller.cage.mem().read_val(fstat_at.into()).unwrap();
        assert_eq!(fstat.size, 7);
        assert_eq!(fstat.ino, stat.ino);
    }

    #[test]
    fn test_mkdir_chdir_getcwd_rmdir() {
        let mut options = test_options();
        options.bypass_acl = true;
        let caller = Caller::new(options);
        let ctx = caller.ctx();

        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let sub_at = put_cstr(&caller, 0, sub.to_str().unwrap());

        assert_eq!(ctx.syscall6(SYS_MKDIR, sub_at, 0o755u32, 0u64, 0u64, 0u64, 0u64), 0);
        assert_eq!(ctx.syscall6(SYS_CHDIR, sub_at, 0u64, 0u64, 0u64, 0u64, 0u64), 0);

        let buf_at = caller.data_addr(0x1000);
        assert_eq!(ctx.syscall6(SYS_GETCWD, buf_at, 256usize, 0u64, 0u64, 0u64, 0u64), 0);
        let cwd = caller
            .cage
            .mem()
            .copy_path_from_user(buf_at.into(), 256)
            .unwrap();
        assert_eq!(std::path::PathBuf::from(cwd), sub);

        // a relative path now resolves under the new cwd
        let rel_at = put_cstr(&caller, 0x200, "inner");
        assert_eq!(ctx.syscall6(SYS_MKDIR, rel_at, 0o755u32, 0u64, 0u64, 0u64, 0u64), 0);
        assert!(sub.join("inner").is_dir());
        assert_eq!(ctx.syscall6(SYS_RMDIR, rel_at, 0u64, 0u64, 0u64, 0u64, 0u64), 0);
        assert!(!sub.join("inner").exists());
    }

    #[test]
    fn test_unlink() {
        let mut options = test_options();
        options.bypass_acl = true;
        let caller = Caller::new(options);

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("gone");
        std::fs::write(&file_path, b"x").unwrap();
        let path_at = put_cstr(&caller, 0, file_path.to_str().unwrap());

        assert_eq!(
            caller.ctx().syscall6(SYS_UNLINK, path_at, 0u64, 0u64, 0u64, 0u64, 0u64),
            0
        );
        assert!(!file_path.exists());
        assert_eq!(
            caller.ctx().syscall6(SYS_UNLINK, path_at, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::ENOENT)
        );
    }

    #[test]
    fn test_path_errors() {
        let mut options = test_options();
        options.bypass_acl = true;
        let caller = Caller::new(options);
        let ctx = caller.ctx();

        // pointer outside the window
        assert_eq!(
            ctx.syscall6(
                SYS_OPEN,
                caller.cage.mem().size(),
                0u64,
                0u64,
                0u64,
                0u64,
                0u64
            ),
            errno(Errno::EFAULT)
        );

        // an unterminated path is a name-too-long
        let at = caller.data_addr(0);
        caller
            .cage
            .mem()
            .copy_to_user(at.into(), &[b'a'; PATH_MAX])
            .unwrap();
        assert_eq!(
            ctx.syscall6(SYS_OPEN, at, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::ENAMETOOLONG)
        );
    }
}
