//! Synchronization objects exposed to cages as descriptors.
//!
//! These wrap host primitives, but expose them with syscall semantics: the
//! lock state must survive between syscalls, so a cage mutex is a condvar-
//! gated flag rather than a host mutex guard held across calls.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime};

use nix::errno::Errno;

/// Largest value a cage semaphore may hold.
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

/// A cage mutex.
#[derive(Debug)]
pub struct MutexFile {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl MutexFile {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> Result<(), Errno> {
        let guard = self.locked.lock().unwrap();
        let mut guard = self
            .cond
            .wait_while(guard, |locked| *locked)
            .unwrap();
        *guard = true;
        Ok(())
    }

    pub fn try_lock(&self) -> Result<(), Errno> {
        let mut guard = self.locked.lock().unwrap();
        if *guard {
            return Err(Errno::EBUSY);
        }
        *guard = true;
        Ok(())
    }

    pub fn unlock(&self) -> Result<(), Errno> {
        let mut guard = self.locked.lock().unwrap();
        if !*guard {
            return Err(Errno::EPERM);
        }
        *guard = false;
        self.cond.notify_one();
        Ok(())
    }
}

impl Default for MutexFile {
    fn default() -> Self {
        Self::new()
    }
}

/// A cage condition variable. Waiters record the generation count at entry
/// and wake once it moves, so a signal can never be consumed by a waiter
/// that arrives later.
#[derive(Debug)]
pub struct CondvarFile {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl CondvarFile {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self, mutex: &MutexFile) -> Result<(), Errno> {
        let guard = self.generation.lock().unwrap();
        let entry_generation = *guard;
        mutex.unlock()?;
        let _guard = self
            .cond
            .wait_while(guard, |generation| *generation == entry_generation)
            .unwrap();
        drop(_guard);
        mutex.lock()?;
        Ok(())
    }

    /// Wait with an absolute CLOCK_REALTIME deadline. ETIMEDOUT leaves the
    /// mutex re-acquired, like the host primitive.
    pub fn timed_wait_abs(&self, mutex: &MutexFile, deadline: Duration) -> Result<(), Errno> {
        let guard = self.generation.lock().unwrap();
        let entry_generation = *guard;
        mutex.unlock()?;

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap();
        let timeout = deadline.saturating_sub(now);
        let (guard, wait_result) = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| {
                *generation == entry_generation
            })
            .unwrap();
        drop(guard);
        mutex.lock()?;
        if wait_result.timed_out() {
            return Err(Errno::ETIMEDOUT);
        }
        Ok(())
    }

    pub fn signal(&self) -> Result<(), Errno> {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.cond.notify_one();
        Ok(())
    }

    pub fn broadcast(&self) -> Result<(), Errno> {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.cond.notify_all();
        Ok(())
    }
}

impl Default for CondvarFile {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore.
#[derive(Debug)]
pub struct SemaphoreFile {
    value: Mutex<u32>,
    cond: Condvar,
}

impl SemaphoreFile {
    pub fn new(init_value: u32) -> Result<Self, Errno> {
        if init_value > SEM_VALUE_MAX {
            return Err(Errno::EINVAL);
        }
        Ok(Self {
            value: Mutex::new(init_value),
            cond: Condvar::new(),
        })
    }

    pub fn wait(&self) -> Result<(), Errno> {
        let guard = self.value.lock().unwrap();
        let mut guard = self.cond.wait_while(guard, |v| *v == 0).unwrap();
        *guard -= 1;
        Ok(())
    }

    pub fn post(&self) -> Result<(), Errno> {
        let mut guard = self.value.lock().unwrap();
        if *guard == SEM_VALUE_MAX {
            return Err(Errno::EOVERFLOW);
        }
        *guard += 1;
        self.cond.notify_one();
        Ok(())
    }

    pub fn get_value(&self) -> u32 {
        *self.value.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutex_lock_unlock() {
        let m = MutexFile::new();
        m.lock().unwrap();
        assert_eq!(m.try_lock(), Err(Errno::EBUSY));
        m.unlock().unwrap();
        m.try_lock().unwrap();
        m.unlock().unwrap();
        // unlocking an unlocked mutex
        assert_eq!(m.unlock(), Err(Errno::EPERM));
    }

    #[test]
    fn test_mutex_contention() {
        let m = Arc::new(MutexFile::new());
        m.lock().unwrap();
        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            m2.lock().unwrap();
            m2.unlock().unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        m.unlock().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_condvar_signal() {
        let m = Arc::new(MutexFile::new());
        let c = Arc::new(CondvarFile::new());
        m.lock().unwrap();
        let (m2, c2) = (Arc::clone(&m), Arc::clone(&c));
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            m2.lock().unwrap();
            c2.signal().unwrap();
            m2.unlock().unwrap();
        });
        c.wait(&m).unwrap();
        m.unlock().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_condvar_timed_wait_expires() {
        let m = MutexFile::new();
        let c = CondvarFile::new();
        m.lock().unwrap();
        let deadline = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            + Duration::from_millis(30);
        assert_eq!(c.timed_wait_abs(&m, deadline), Err(Errno::ETIMEDOUT));
        // the mutex is re-acquired on the timeout path
        m.unlock().unwrap();
    }

    #[test]
    fn test_semaphore() {
        let s = SemaphoreFile::new(2).unwrap();
        s.wait().unwrap();
        s.wait().unwrap();
        assert_eq!(s.get_value(), 0);
        s.post().unwrap();
        assert_eq!(s.get_value(), 1);
        assert!(SemaphoreFile::new(SEM_VALUE_MAX + 1).is_err());
    }

    #[test]
    fn test_semaphore_blocks_until_post() {
        let s = Arc::new(SemaphoreFile::new(0).unwrap());
        let s2 = Arc::clone(&s);
        let handle = std::thread::spawn(move || s2.wait());
        std::thread::sleep(Duration::from_millis(20));
        s.post().unwrap();
        handle.join().unwrap().unwrap();
    }
}
