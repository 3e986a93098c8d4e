//! Access and manage the memory of a cage.
//!
//! Each cage owns one [`AddressSpace`]: a contiguous host reservation of
//! `2^addr_bits` bytes. Untrusted pointers are offsets into that window;
//! every translation and copy goes through the `AddressSpace` so that a
//! pointer outside the window can never reach host memory.

use std::ffi::c_void;
use std::num::NonZeroUsize;

use anyhow::Context;
use log::*;
use nix::errno::Errno;
use nix::sys::mman;

use crate::host::syscall::types::{UserArrayPtr, UserPtr};

pub mod vm_map;

pub use vm_map::{FileBacking, VmEntry, VmMap};

/// The protection granularity the runtime advertises to cages.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Allocation granularity; placement and lengths are rounded to this.
/// Coarser than `PAGE_SIZE` to match the worst host allocator we run on.
pub const ALLOC_PAGE_SHIFT: usize = 16;
pub const ALLOC_PAGE_SIZE: usize = 1 << ALLOC_PAGE_SHIFT;

pub fn round_page(len: usize) -> usize {
    crate::utility::round_up_pow2(len, PAGE_SIZE)
}

pub fn round_alloc_page(len: usize) -> usize {
    crate::utility::round_up_pow2(len, ALLOC_PAGE_SIZE)
}

pub fn is_alloc_page_multiple(addr: usize) -> bool {
    addr & (ALLOC_PAGE_SIZE - 1) == 0
}

bitflags::bitflags! {
    /// Page protection bits of the cage ABI.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags::bitflags! {
    /// Mapping flags of the cage ABI.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

impl Prot {
    pub fn as_host(&self) -> mman::ProtFlags {
        let mut prot = mman::ProtFlags::PROT_NONE;
        if self.contains(Prot::READ) {
            prot |= mman::ProtFlags::PROT_READ;
        }
        if self.contains(Prot::WRITE) {
            prot |= mman::ProtFlags::PROT_WRITE;
        }
        if self.contains(Prot::EXEC) {
            prot |= mman::ProtFlags::PROT_EXEC;
        }
        prot
    }
}

/// A cage's address window.
///
/// The window is reserved inaccessible at construction; regions become
/// accessible as the owning cage's mappings commit them. Translated host
/// pointers are only dereferenced for the duration of a single copy.
#[derive(Debug)]
pub struct AddressSpace {
    base: *mut c_void,
    addr_bits: u32,
}

// Safety: the AddressSpace owns the reservation for its whole lifetime, and
// copies never hand out references that outlive a call.
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    pub fn new(addr_bits: u32) -> anyhow::Result<Self> {
        assert!(addr_bits >= ALLOC_PAGE_SHIFT as u32 && addr_bits < usize::BITS);
        let size = NonZeroUsize::new(1usize << addr_bits).unwrap();
        let base = unsafe {
            mman::mmap_anonymous(
                None,
                size,
                mman::ProtFlags::PROT_NONE,
                mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_NORESERVE,
            )
        }
        .context("reserving cage address window")?;
        debug!(
            "reserved {}-bit cage window at {:p}",
            addr_bits,
            base.as_ptr()
        );
        Ok(Self {
            base: base.as_ptr(),
            addr_bits,
        })
    }

    pub fn addr_bits(&self) -> u32 {
        self.addr_bits
    }

    /// Size of the window in bytes.
    pub fn size(&self) -> usize {
        1usize << self.addr_bits
    }

    pub fn num_pages(&self) -> usize {
        self.size() >> PAGE_SHIFT
    }

    /// Host address of the window base.
    pub fn base(&self) -> *mut u8 {
        self.base as *mut u8
    }

    pub fn contains_range(&self, ptr: UserPtr, len: usize) -> bool {
        let start = usize::from(ptr);
        match start.checked_add(len) {
            Some(end) => end <= self.size(),
            None => false,
        }
    }

    /// Translate a user address. Fails unless the address lies within the
    /// window.
    pub fn user_to_sys(&self, ptr: UserPtr) -> Result<*mut u8, Errno> {
        self.user_to_sys_range(ptr, 1)
    }

    /// Translate a user range. Fails unless the whole range lies within the
    /// window (overflow included).
    pub fn user_to_sys_range(&self, ptr: UserPtr, len: usize) -> Result<*mut u8, Errno> {
        if !self.contains_range(ptr, len) {
            return Err(Errno::EFAULT);
        }
        Ok(unsafe { self.base().add(usize::from(ptr)) })
    }

    pub fn copy_from_user(&self, dst: &mut [u8], src: UserPtr) -> Result<(), Errno> {
        let sys = self.user_to_sys_range(src, dst.len())?;
        unsafe { std::ptr::copy_nonoverlapping(sys, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    pub fn copy_to_user(&self, dst: UserPtr, src: &[u8]) -> Result<(), Errno> {
        let sys = self.user_to_sys_range(dst, src.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), sys, src.len()) };
        Ok(())
    }

    /// Copy a `repr(C)` value out of the cage. The user pointer may be
    /// unaligned.
    pub fn read_val<T: Copy>(&self, src: UserPtr) -> Result<T, Errno> {
        let sys = self.user_to_sys_range(src, std::mem::size_of::<T>())?;
        Ok(unsafe { std::ptr::read_unaligned(sys as *const T) })
    }

    /// Copy a `repr(C)` value into the cage. The user pointer may be
    /// unaligned.
    pub fn write_val<T: Copy>(&self, dst: UserPtr, val: &T) -> Result<(), Errno> {
        let sys = self.user_to_sys_range(dst, std::mem::size_of::<T>())?;
        unsafe { std::ptr::write_unaligned(sys as *mut T, *val) };
        Ok(())
    }

    /// Copy a slice of values out of the cage.
    pub fn read_vals<T: Copy>(&self, src: UserArrayPtr<T>) -> Result<Vec<T>, Errno> {
        let sys = self.user_to_sys_range(src.ptr(), src.num_bytes())?;
        let mut out = Vec::with_capacity(src.len());
        for i in 0..src.len() {
            out.push(unsafe { std::ptr::read_unaligned((sys as *const T).add(i)) });
        }
        Ok(out)
    }

    /// Copy a slice of values into the cage.
    pub fn write_vals<T: Copy>(&self, dst: UserArrayPtr<T>, vals: &[T]) -> Result<(), Errno> {
        assert!(vals.len() <= dst.len());
        let sys = self.user_to_sys_range(dst.ptr(), dst.num_bytes())?;
        for (i, val) in vals.iter().enumerate() {
            unsafe { std::ptr::write_unaligned((sys as *mut T).add(i), *val) };
        }
        Ok(())
    }

    /// Copy a NUL-terminated string out of the cage, reading at most
    /// `max_len` bytes. A string running off the end of the window is
    /// EFAULT; one exceeding `max_len` is ENAMETOOLONG.
    pub fn copy_path_from_user(&self, src: UserPtr, max_len: usize) -> Result<String, Errno> {
        let start = usize::from(src);
        if start >= self.size() {
            return Err(Errno::EFAULT);
        }
        let readable = std::cmp::min(max_len, self.size() - start);
        let mut buf = vec![0u8; readable];
        self.copy_from_user(&mut buf, src)?;
        match buf.iter().position(|&b| b == 0) {
            Some(n) => String::from_utf8(buf[..n].to_vec()).map_err(|_| Errno::EINVAL),
            // no NUL before the end of the window: not a string
            None if readable < max_len => Err(Errno::EFAULT),
            None => Err(Errno::ENAMETOOLONG),
        }
    }

    /// Make `[start, start + len)` accessible with the given protection,
    /// committing fresh zero pages.
    pub fn commit(&self, start: usize, len: usize, prot: Prot) -> Result<(), Errno> {
        let sys = self.user_to_sys_range(UserPtr::from(start), len)?;
        unsafe {
            mman::mmap_anonymous(
                Some(NonZeroUsize::new(sys as usize).unwrap()),
                NonZeroUsize::new(len).ok_or(Errno::EINVAL)?,
                prot.as_host(),
                mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_FIXED,
            )
        }
        .map_err(|e| {
            warn!("committing cage pages failed: {}", e);
            e
        })?;
        Ok(())
    }

    /// Change protection on already-committed pages.
    pub fn protect(&self, start: usize, len: usize, prot: Prot) -> Result<(), Errno> {
        let sys = self.user_to_sys_range(UserPtr::from(start), len)?;
        unsafe { mman::mprotect(std::ptr::NonNull::new(sys as *mut c_void).unwrap(), len, prot.as_host()) }
    }

    /// Replace `[start, start + len)` with inaccessible zero-fill pages.
    /// The window never develops holes; unmapping is remapping to nothing.
    pub fn discard(&self, start: usize, len: usize) -> Result<(), Errno> {
        let sys = self.user_to_sys_range(UserPtr::from(start), len)?;
        unsafe {
            mman::mmap_anonymous(
                Some(NonZeroUsize::new(sys as usize).unwrap()),
                NonZeroUsize::new(len).ok_or(Errno::EINVAL)?,
                mman::ProtFlags::PROT_NONE,
                mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_FIXED | mman::MapFlags::MAP_NORESERVE,
            )
        }
        .map_err(|e| {
            warn!("discarding cage pages failed: {}", e);
            e
        })?;
        Ok(())
    }

    /// Zero a range of committed, writable pages.
    pub fn zero(&self, start: usize, len: usize) -> Result<(), Errno> {
        let sys = self.user_to_sys_range(UserPtr::from(start), len)?;
        unsafe { std::ptr::write_bytes(sys, 0, len) };
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Err(e) = unsafe {
            mman::munmap(std::ptr::NonNull::new(self.base).unwrap(), self.size())
        } {
            warn!("releasing cage window: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(24).unwrap()
    }

    #[test]
    fn test_translation_bounds() {
        let mem = space();
        assert!(mem.user_to_sys(UserPtr::from(0usize)).is_ok());
        assert!(mem.user_to_sys(UserPtr::from(mem.size() - 1)).is_ok());
        assert_eq!(
            mem.user_to_sys(UserPtr::from(mem.size())),
            Err(Errno::EFAULT)
        );
        assert_eq!(
            mem.user_to_sys_range(UserPtr::from(mem.size() - 8), 16),
            Err(Errno::EFAULT)
        );
        // overflowing range
        assert_eq!(
            mem.user_to_sys_range(UserPtr::from(usize::MAX), 2),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn test_copy_round_trip() {
        let mem = space();
        mem.commit(ALLOC_PAGE_SIZE, ALLOC_PAGE_SIZE, Prot::READ | Prot::WRITE)
            .unwrap();
        let ptr = UserPtr::from(ALLOC_PAGE_SIZE + 24);
        mem.copy_to_user(ptr, b"hello cage").unwrap();
        let mut buf = [0u8; 10];
        mem.copy_from_user(&mut buf, ptr).unwrap();
        assert_eq!(&buf, b"hello cage");
    }

    #[test]
    fn test_path_copy() {
        let mem = space();
        mem.commit(ALLOC_PAGE_SIZE, ALLOC_PAGE_SIZE, Prot::READ | Prot::WRITE)
            .unwrap();
        let ptr = UserPtr::from(ALLOC_PAGE_SIZE);
        mem.copy_to_user(ptr, b"/tmp/x\0").unwrap();
        assert_eq!(mem.copy_path_from_user(ptr, 256).unwrap(), "/tmp/x");
        // unterminated within the limit
        mem.copy_to_user(ptr, &[b'a'; 16]).unwrap();
        assert_eq!(mem.copy_path_from_user(ptr, 8), Err(Errno::ENAMETOOLONG));
        // out of window entirely
        assert_eq!(
            mem.copy_path_from_user(UserPtr::from(mem.size()), 8),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn test_discard_then_commit() {
        let mem = space();
        mem.commit(0x20000, 0x10000, Prot::READ | Prot::WRITE).unwrap();
        mem.copy_to_user(UserPtr::from(0x20000usize), &[7u8; 8]).unwrap();
        mem.discard(0x20000, 0x10000).unwrap();
        mem.commit(0x20000, 0x10000, Prot::READ | Prot::WRITE).unwrap();
        // fresh zero pages
        let mut buf = [1u8; 8];
        mem.copy_from_user(&mut buf, UserPtr::from(0x20000usize)).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }
}
