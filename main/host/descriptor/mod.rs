//! Cage descriptors and the objects they name.
//!
//! A cage-visible file descriptor resolves through the per-cage
//! [`DescriptorTable`](table::DescriptorTable) to a [`Descriptor`], which
//! pairs per-fd flags with a shared, reference-counted [`FileHandle`].
//! The handle is a variant over the descriptor kinds the runtime knows;
//! operations a kind doesn't support fail with EINVAL, mirroring the
//! unimplemented entries of the old vtable scheme.

use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;

use crate::utility::{IsSend, IsSync};

pub mod host_io;
pub mod imc;
pub mod shm;
pub mod sync;
pub mod table;

pub use host_io::{AbiStat, HostIoFile, SeekWhence};
pub use imc::{BoundSocketFile, ConnCapFile, ConnectedSocketFile, ImcMessage};
pub use shm::ShmFile;
pub use sync::{CondvarFile, MutexFile, SemaphoreFile};

/// Longest path the broker will copy out of a cage.
pub const PATH_MAX: usize = 4096;

bitflags::bitflags! {
    /// Per-fd flags, not shared between duped descriptors.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DescriptorFlags: u32 {
        const CLOEXEC = 1;
    }
}

bitflags::bitflags! {
    /// Access mode of a descriptor's open file description.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FileMode: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// A shared handle to one of the runtime's file-like objects.
#[derive(Clone, Debug)]
pub enum FileHandle {
    HostIo(Arc<AtomicRefCell<HostIoFile>>),
    Shm(Arc<ShmFile>),
    Mutex(Arc<MutexFile>),
    Condvar(Arc<CondvarFile>),
    Semaphore(Arc<SemaphoreFile>),
    BoundSocket(Arc<BoundSocketFile>),
    ConnCap(Arc<ConnCapFile>),
    ConnectedSocket(Arc<ConnectedSocketFile>),
    Invalid,
}

// will not compile if `FileHandle` is not Send + Sync
impl IsSend for FileHandle {}
impl IsSync for FileHandle {}

impl FileHandle {
    pub fn invalid() -> Self {
        Self::Invalid
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::HostIo(_) => "host_io",
            Self::Shm(_) => "shm",
            Self::Mutex(_) => "mutex",
            Self::Condvar(_) => "condvar",
            Self::Semaphore(_) => "semaphore",
            Self::BoundSocket(_) => "bound_socket",
            Self::ConnCap(_) => "conn_cap",
            Self::ConnectedSocket(_) => "connected_socket",
            Self::Invalid => "invalid",
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// A stable identity for the underlying object, independent of which
    /// handle or table entry names it.
    pub fn canonical_id(&self) -> usize {
        match self {
            Self::HostIo(f) => Arc::as_ptr(f) as usize,
            Self::Shm(f) => Arc::as_ptr(f) as usize,
            Self::Mutex(f) => Arc::as_ptr(f) as usize,
            Self::Condvar(f) => Arc::as_ptr(f) as usize,
            Self::Semaphore(f) => Arc::as_ptr(f) as usize,
            Self::BoundSocket(f) => Arc::as_ptr(f) as usize,
            Self::ConnCap(f) => Arc::as_ptr(f) as usize,
            Self::ConnectedSocket(f) => Arc::as_ptr(f) as usize,
            Self::Invalid => 0,
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        match self {
            Self::HostIo(f) => f.borrow_mut().read(buf),
            Self::ConnectedSocket(s) => s.read_stream(buf),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        match self {
            Self::HostIo(f) => f.borrow_mut().write(buf),
            Self::ConnectedSocket(s) => s.write_stream(buf),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn seek(&self, offset: i64, whence: SeekWhence) -> Result<i64, Errno> {
        match self {
            Self::HostIo(f) => f.borrow_mut().seek(offset, whence),
            _ => Err(Errno::ESPIPE),
        }
    }

    pub fn stat(&self) -> Result<AbiStat, Errno> {
        match self {
            Self::HostIo(f) => f.borrow().stat(),
            Self::Shm(f) => f.stat(),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn getdents(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        match self {
            Self::HostIo(f) => f.borrow_mut().getdents(buf),
            _ => Err(Errno::ENOTDIR),
        }
    }

    pub fn ioctl(&self, request: u64) -> Result<i32, Errno> {
        match self {
            Self::HostIo(f) => f.borrow_mut().ioctl(request),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Read `buf.len()` bytes at `offset` without moving any file
    /// position; short data past end-of-file leaves the tail untouched and
    /// reports how much was read.
    pub fn pread_all(&self, buf: &mut [u8], offset: i64) -> Result<usize, Errno> {
        match self {
            Self::HostIo(f) => f.borrow().pread_all(buf, offset),
            Self::Shm(f) => f.pread_all(buf, offset),
            _ => Err(Errno::ENODEV),
        }
    }

    /// Whether the backing object may be mapped executable, subject to the
    /// validator.
    pub fn is_safe_for_mmap(&self) -> bool {
        match self {
            Self::HostIo(f) => f.borrow().is_regular(),
            Self::Shm(_) => true,
            _ => false,
        }
    }

    /// Host file descriptor usable for a shared host mapping, if the kind
    /// supports one.
    pub fn mappable_host_fd(&self) -> Option<std::os::fd::RawFd> {
        match self {
            Self::Shm(f) => Some(f.host_fd()),
            _ => None,
        }
    }

    pub fn as_mutex(&self) -> Result<&Arc<MutexFile>, Errno> {
        match self {
            Self::Mutex(m) => Ok(m),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn as_condvar(&self) -> Result<&Arc<CondvarFile>, Errno> {
        match self {
            Self::Condvar(c) => Ok(c),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn as_semaphore(&self) -> Result<&Arc<SemaphoreFile>, Errno> {
        match self {
            Self::Semaphore(s) => Ok(s),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn as_bound_socket(&self) -> Result<&Arc<BoundSocketFile>, Errno> {
        match self {
            Self::BoundSocket(s) => Ok(s),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn as_conn_cap(&self) -> Result<&Arc<ConnCapFile>, Errno> {
        match self {
            Self::ConnCap(c) => Ok(c),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn as_connected_socket(&self) -> Result<&Arc<ConnectedSocketFile>, Errno> {
        match self {
            Self::ConnectedSocket(s) => Ok(s),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// A table entry: per-fd flags plus the shared file handle.
#[derive(Clone, Debug)]
pub struct Descriptor {
    file: FileHandle,
    flags: DescriptorFlags,
}

impl Descriptor {
    pub fn new(file: FileHandle) -> Self {
        Self {
            file,
            flags: DescriptorFlags::empty(),
        }
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    pub fn into_file(self) -> FileHandle {
        self.file
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        self.flags = flags;
    }

    /// A new descriptor naming the same file, with its own flags.
    pub fn dup(&self, flags: DescriptorFlags) -> Self {
        Self {
            file: self.file.clone(),
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_ops_fail_cleanly() {
        let f = FileHandle::Mutex(Arc::new(MutexFile::new()));
        assert_eq!(f.read(&mut [0u8; 4]), Err(Errno::EINVAL));
        assert_eq!(f.write(&[0u8; 4]), Err(Errno::EINVAL));
        assert_eq!(f.seek(0, SeekWhence::Set), Err(Errno::ESPIPE));
        assert!(!f.is_safe_for_mmap());
        assert!(f.as_condvar().is_err());
        assert!(f.as_mutex().is_ok());
    }

    #[test]
    fn test_dup_shares_file() {
        let f = FileHandle::Semaphore(Arc::new(SemaphoreFile::new(1).unwrap()));
        let d = Descriptor::new(f);
        let d2 = d.dup(DescriptorFlags::CLOEXEC);
        assert_eq!(d.file().canonical_id(), d2.file().canonical_id());
        assert_ne!(d.flags(), d2.flags());
    }
}
