//! Map of cage-visible fd numbers to descriptors. Owned by a Cage.

use std::collections::BTreeMap;

use log::*;

use crate::host::descriptor::Descriptor;

/// First fd number reserved for in-runtime pipe endpoints. Entries at or
/// above this value are installed by the pipe syscall, never by the
/// lowest-free allocator.
pub const PIPE_FD_BASE: u32 = 8000;

/// Which end of a pipe slot an fd names.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// A table entry: an ordinary descriptor, or a sentinel routing to one end
/// of an in-runtime pipe slot.
#[derive(Clone, Debug)]
pub enum FdEntry {
    Descriptor(Descriptor),
    Pipe { slot: usize, end: PipeEnd },
}

impl FdEntry {
    /// The sentinel fd number encoding this pipe end.
    pub fn pipe_fd(slot: usize, end: PipeEnd) -> u32 {
        let parity = match end {
            PipeEnd::Read => 0,
            PipeEnd::Write => 1,
        };
        PIPE_FD_BASE + 2 * slot as u32 + parity
    }
}

/// Map of fd numbers to entries.
///
/// One ordered map carries everything: the ordinary fds below
/// `PIPE_FD_BASE` and the pipe sentinels above it. Keeping the keys sorted
/// is what makes lowest-free allocation a walk along the occupied prefix,
/// with no separate free list to keep in sync with the entries.
pub struct DescriptorTable {
    entries: BTreeMap<u32, FdEntry>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            entries: BTreeMap::new(),
        }
    }

    /// Add the descriptor at the lowest unused fd at or above `min_index`,
    /// and return that fd.
    pub fn add(&mut self, descriptor: Descriptor, min_index: u32) -> u32 {
        self.add_entry(FdEntry::Descriptor(descriptor), min_index)
    }

    /// Like [`add`](Self::add), for any entry kind.
    pub fn add_entry(&mut self, entry: FdEntry, min_index: u32) -> u32 {
        // The candidate chases the occupied keys upward; the first key
        // that jumps past it reveals a gap. Sentinel fds sit outside the
        // scanned range, so they never capture an ordinary allocation.
        let mut fd = min_index;
        for &used in self.entries.range(min_index..PIPE_FD_BASE).map(|(k, _)| k) {
            if used > fd {
                break;
            }
            fd = used + 1;
        }
        trace!("allocating fd {}", fd);
        let prev = self.entries.insert(fd, entry);
        debug_assert!(prev.is_none(), "fd {} was supposed to be free", fd);
        fd
    }

    /// Remove the entry at the given fd and return it. The number is free
    /// for reuse the moment this returns.
    pub fn remove(&mut self, fd: u32) -> Option<FdEntry> {
        self.entries.remove(&fd)
    }

    /// Get the entry at `fd`, if any.
    pub fn get(&self, fd: u32) -> Option<&FdEntry> {
        self.entries.get(&fd)
    }

    /// Install an entry at a caller-chosen fd, evicting and returning
    /// whatever was there. Numbers placed this way are simply occupied
    /// keys; the allocator walks around them.
    pub fn set(&mut self, fd: u32, entry: FdEntry) -> Option<FdEntry> {
        let prev = self.entries.insert(fd, entry);
        trace!(
            "installed fd {} ({})",
            fd,
            if prev.is_some() { "replacing" } else { "fresh" }
        );
        prev
    }

    /// One past the highest ordinary fd currently in the table.
    pub fn high_water(&self) -> u32 {
        self.entries
            .range(..PIPE_FD_BASE)
            .next_back()
            .map(|(&fd, _)| fd + 1)
            .unwrap_or(0)
    }

    /// Remove and return all entries.
    pub fn remove_all(&mut self) -> impl Iterator<Item = FdEntry> {
        std::mem::take(&mut self.entries).into_values()
    }

    /// Entries for a forked child: same files, refcounts bumped by the
    /// clone.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}
