//! Shared-memory objects, backed by anonymous host memfds.

use std::fs;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;

use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use crate::host::descriptor::AbiStat;
use crate::host::memory::round_alloc_page;

/// An anonymous shared-memory object created via `imc_mem_obj_create`.
///
/// Mappings of the object are real shared host mappings of the memfd, so
/// stores through one cage's mapping are visible through every other.
#[derive(Debug)]
pub struct ShmFile {
    file: fs::File,
    size: usize,
}

impl ShmFile {
    /// Create an object of the given size, rounded up to the allocation
    /// granularity.
    pub fn new(size: usize) -> Result<Self, Errno> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        let size = round_alloc_page(size);
        let name = std::ffi::CString::new("cage-shm").unwrap();
        let fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)?;
        let file = fs::File::from(fd);
        file.set_len(size as u64).map_err(|_| Errno::ENOMEM)?;
        Ok(Self { file, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn host_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn stat(&self) -> Result<AbiStat, Errno> {
        Ok(AbiStat {
            size: self.size as i64,
            ..Default::default()
        })
    }

    pub fn pread_all(&self, buf: &mut [u8], offset: i64) -> Result<usize, Errno> {
        let offset = u64::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[done..], offset + done as u64)
                .map_err(|_| Errno::EIO)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::ALLOC_PAGE_SIZE;
    use std::io::Write;

    #[test]
    fn test_size_rounded() {
        let shm = ShmFile::new(100).unwrap();
        assert_eq!(shm.size(), ALLOC_PAGE_SIZE);
        assert!(ShmFile::new(0).is_err());
    }

    #[test]
    fn test_pread() {
        let mut shm = ShmFile::new(ALLOC_PAGE_SIZE).unwrap();
        shm.file.write_all(b"shared bytes").unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(shm.pread_all(&mut buf, 7).unwrap(), 6);
        assert_eq!(&buf, b"bytes\0");
    }
}
