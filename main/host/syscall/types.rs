//! Types used on the syscall boundary.

use std::marker::PhantomData;
use std::mem::size_of;

use nix::errno::Errno;

/// Represents a pointer to a virtual address inside a cage's address window.
///
/// The raw value is an offset into the window, not a host address; it is
/// only meaningful together with the owning cage's
/// [`AddressSpace`](crate::host::memory::AddressSpace).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct UserPtr {
    val: usize,
}

impl UserPtr {
    pub fn null() -> Self {
        Self { val: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.val == 0
    }

    /// Byte offset from this pointer. Saturating would hide bugs; overflow
    /// panics in debug builds and wraps in release like the hardware would.
    pub fn add(&self, offset: usize) -> Self {
        Self {
            val: self.val.wrapping_add(offset),
        }
    }
}

impl From<UserPtr> for usize {
    fn from(v: UserPtr) -> usize {
        v.val
    }
}

impl From<usize> for UserPtr {
    fn from(v: usize) -> UserPtr {
        UserPtr { val: v }
    }
}

impl From<u64> for UserPtr {
    fn from(v: u64) -> UserPtr {
        UserPtr {
            val: v.try_into().unwrap(),
        }
    }
}

impl From<UserPtr> for u64 {
    fn from(v: UserPtr) -> u64 {
        v.val.try_into().unwrap()
    }
}

impl std::fmt::Pointer for UserPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ptr = self.val as *const libc::c_void;
        std::fmt::Pointer::fmt(&ptr, f)
    }
}

/// A [`UserPtr`] together with an element type and count.
#[derive(Copy, Clone)]
pub struct UserArrayPtr<T> {
    base: UserPtr,
    count: usize,
    _phantom: PhantomData<T>,
}

impl<T> std::fmt::Debug for UserArrayPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserArrayPtr")
            .field("base", &self.base)
            .field("count", &self.count)
            .field("size_of::<T>", &size_of::<T>())
            .finish()
    }
}

impl<T> UserArrayPtr<T> {
    pub fn new(ptr: UserPtr, count: usize) -> Self {
        UserArrayPtr {
            base: ptr,
            count,
            _phantom: PhantomData,
        }
    }

    pub fn ptr(&self) -> UserPtr {
        self.base
    }

    /// Number of items pointed to.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// Total size in bytes.
    pub fn num_bytes(&self) -> usize {
        self.count * size_of::<T>()
    }
}

/// A register used for input/output in a syscall.
#[derive(Copy, Clone, Eq)]
#[repr(C)]
pub union SyscallReg {
    pub as_i64: i64,
    pub as_u64: u64,
}

// SyscallReg and all of its fields must be transmutable with a 64 bit integer.
static_assertions::assert_eq_align!(SyscallReg, u64);
static_assertions::assert_eq_size!(SyscallReg, u64);

impl PartialEq for SyscallReg {
    fn eq(&self, other: &Self) -> bool {
        unsafe { self.as_u64 == other.as_u64 }
    }
}

impl From<u64> for SyscallReg {
    fn from(v: u64) -> Self {
        Self { as_u64: v }
    }
}

impl From<SyscallReg> for u64 {
    fn from(v: SyscallReg) -> u64 {
        unsafe { v.as_u64 }
    }
}

impl From<u32> for SyscallReg {
    fn from(v: u32) -> Self {
        Self { as_u64: v as u64 }
    }
}

impl From<SyscallReg> for u32 {
    fn from(v: SyscallReg) -> u32 {
        (unsafe { v.as_u64 }) as u32
    }
}

impl From<usize> for SyscallReg {
    fn from(v: usize) -> Self {
        Self { as_u64: v as u64 }
    }
}

impl From<SyscallReg> for usize {
    fn from(v: SyscallReg) -> usize {
        unsafe { v.as_u64 as usize }
    }
}

impl From<i64> for SyscallReg {
    fn from(v: i64) -> Self {
        Self { as_i64: v }
    }
}

impl From<SyscallReg> for i64 {
    fn from(v: SyscallReg) -> i64 {
        unsafe { v.as_i64 }
    }
}

impl From<i32> for SyscallReg {
    fn from(v: i32) -> Self {
        Self { as_i64: v as i64 }
    }
}

impl From<SyscallReg> for i32 {
    fn from(v: SyscallReg) -> i32 {
        (unsafe { v.as_i64 }) as i32
    }
}

impl From<UserPtr> for SyscallReg {
    fn from(v: UserPtr) -> Self {
        Self {
            as_u64: u64::from(v),
        }
    }
}

impl From<SyscallReg> for UserPtr {
    fn from(v: SyscallReg) -> UserPtr {
        UserPtr::from(unsafe { v.as_u64 })
    }
}

// Useful for syscalls whose strongly-typed wrappers return some Result<(), ErrType>
impl From<()> for SyscallReg {
    fn from(_: ()) -> SyscallReg {
        SyscallReg { as_i64: 0 }
    }
}

impl std::fmt::Debug for SyscallReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallReg")
            .field("as_i64", unsafe { &self.as_i64 })
            .field("as_u64", unsafe { &self.as_u64 })
            .finish()
    }
}

/// The raw arguments an untrusted caller supplied for one syscall.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SyscallArgs {
    pub number: u32,
    pub args: [SyscallReg; 6],
}

impl SyscallArgs {
    pub fn new(number: u32, args: [SyscallReg; 6]) -> Self {
        Self { number, args }
    }

    pub fn get(&self, i: usize) -> SyscallReg {
        self.args[i]
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

/// An errno to surface to the untrusted caller.
///
/// Calling this an 'error' is stretching the semantics a bit, but it makes
/// for fluent handler bodies using the `?` operator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyscallError {
    pub errno: Errno,
}

pub type SyscallResult = Result<SyscallReg, SyscallError>;

impl From<Errno> for SyscallError {
    fn from(errno: Errno) -> Self {
        SyscallError { errno }
    }
}

impl From<std::io::Error> for SyscallError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(raw) => SyscallError {
                errno: Errno::from_i32(raw),
            },
            None => {
                let default = Errno::EIO;
                log::warn!("Mapping error {} to {}", e, default);
                SyscallError { errno: default }
            }
        }
    }
}

/// Largest magnitude the error ABI reserves for errno values; anything in
/// `[-MAX_ERRNO, -1]` is an error, everything else is a payload.
pub const MAX_ERRNO: i64 = 4096;

/// Flattens a handler result into the signed 32-bit return the untrusted
/// caller sees. A success payload that doesn't fit the user ABI means the
/// broker produced an out-of-window value, which is unrecoverable.
pub fn to_raw_return(result: SyscallResult) -> i32 {
    match result {
        Ok(reg) => {
            let val = u64::from(reg);
            if val > u32::MAX as u64 {
                panic!("syscall produced out-of-range user value {:#x}", val);
            }
            val as u32 as i32
        }
        Err(e) => {
            let errno = e.errno as i64;
            assert!(errno > 0 && errno < MAX_ERRNO);
            -(errno as i32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_return_payload() {
        assert_eq!(to_raw_return(Ok(5u32.into())), 5);
        // user addresses above 2^31 pass through bit-exactly
        assert_eq!(to_raw_return(Ok(0x8000_1000u64.into())) as u32, 0x8000_1000);
    }

    #[test]
    fn test_raw_return_errno() {
        assert_eq!(
            to_raw_return(Err(Errno::EBADF.into())),
            -(Errno::EBADF as i32)
        );
    }

    #[test]
    #[should_panic]
    fn test_raw_return_overflow_is_fatal() {
        to_raw_return(Ok((u32::MAX as u64 + 1).into()));
    }
}
