//! The in-runtime pipe set: a small fixed set of single-producer,
//! single-consumer byte channels used to stream one cage's stdout into
//! another's stdin.
//!
//! Each slot is a bounded rendezvous buffer with two states, empty and
//! full. The writer blocks while the slot is full, the reader while it is
//! empty and the stream is still open. Blocking is condvar-gated; the slot
//! index travels in the sentinel fd a cage receives from `pipe`, so routing
//! never depends on which cage is calling.

use std::sync::{Condvar, Mutex};

use log::*;
use nix::errno::Errno;

use crate::host::descriptor::table::PipeEnd;

#[derive(Debug, Default)]
struct SlotState {
    buf: Vec<u8>,
    full: bool,
    transfer_over: bool,
    read_open: bool,
    write_open: bool,
    in_use: bool,
}

#[derive(Debug)]
struct PipeSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl PipeSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            cond: Condvar::new(),
        }
    }
}

/// The process-wide pipe slots.
#[derive(Debug)]
pub struct PipeSet {
    slots: Vec<PipeSlot>,
    capacity: usize,
}

impl PipeSet {
    pub fn new(num_slots: usize, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            slots: (0..num_slots).map(|_| PipeSlot::new()).collect(),
            capacity,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot, resetting it to empty with both ends open.
    pub fn allocate(&self) -> Result<usize, Errno> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut state = slot.state.lock().unwrap();
            if !state.in_use {
                *state = SlotState {
                    buf: Vec::new(),
                    full: false,
                    transfer_over: false,
                    read_open: true,
                    write_open: true,
                    in_use: true,
                };
                debug!("allocated pipe slot {}", i);
                return Ok(i);
            }
        }
        Err(Errno::ENFILE)
    }

    fn slot(&self, idx: usize) -> Result<&PipeSlot, Errno> {
        self.slots.get(idx).ok_or(Errno::EBADF)
    }

    /// Write one transfer into the slot, blocking while it is full. The
    /// data is clamped to the slot capacity.
    pub fn write(&self, idx: usize, data: &[u8]) -> Result<usize, Errno> {
        let slot = self.slot(idx)?;
        let state = slot.state.lock().unwrap();
        if !state.in_use || !state.write_open {
            return Err(Errno::EBADF);
        }
        let mut state = slot
            .cond
            .wait_while(state, |s| s.full && s.read_open)
            .unwrap();
        if !state.read_open {
            return Err(Errno::EPIPE);
        }
        let n = std::cmp::min(data.len(), self.capacity);
        state.buf.clear();
        state.buf.extend_from_slice(&data[..n]);
        state.full = true;
        state.transfer_over = true;
        slot.cond.notify_all();
        Ok(n)
    }

    /// Read the pending transfer, blocking while the slot is empty and the
    /// stream is open. Returns 0 at end of stream.
    pub fn read(&self, idx: usize, buf: &mut [u8]) -> Result<usize, Errno> {
        let slot = self.slot(idx)?;
        let state = slot.state.lock().unwrap();
        if !state.in_use || !state.read_open {
            return Err(Errno::EBADF);
        }
        let mut state = slot
            .cond
            .wait_while(state, |s| !s.full && !s.transfer_over && s.write_open)
            .unwrap();
        if !state.full {
            // drained and the transfer is over (or the writer is gone)
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), state.buf.len());
        buf[..n].copy_from_slice(&state.buf[..n]);
        state.buf.clear();
        state.full = false;
        slot.cond.notify_all();
        Ok(n)
    }

    /// Drop one end. Closing the write end ends the stream; once both ends
    /// are closed the slot is recycled.
    pub fn close_end(&self, idx: usize, end: PipeEnd) -> Result<(), Errno> {
        let slot = self.slot(idx)?;
        let mut state = slot.state.lock().unwrap();
        if !state.in_use {
            return Err(Errno::EBADF);
        }
        match end {
            PipeEnd::Read => {
                if !state.read_open {
                    return Err(Errno::EBADF);
                }
                state.read_open = false;
            }
            PipeEnd::Write => {
                if !state.write_open {
                    return Err(Errno::EBADF);
                }
                state.write_open = false;
                state.transfer_over = true;
            }
        }
        if !state.read_open && !state.write_open {
            debug!("recycling pipe slot {}", idx);
            state.in_use = false;
        }
        slot.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn set() -> Arc<PipeSet> {
        Arc::new(PipeSet::new(2, 64))
    }

    #[test]
    fn test_write_then_read() {
        let pipes = set();
        let slot = pipes.allocate().unwrap();
        assert_eq!(pipes.write(slot, b"sixty-four bytes? no").unwrap(), 20);
        let mut buf = [0u8; 64];
        assert_eq!(pipes.read(slot, &mut buf).unwrap(), 20);
        assert_eq!(&buf[..20], b"sixty-four bytes? no");
        // drained and marked over: next read is end-of-stream
        assert_eq!(pipes.read(slot, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reader_blocks_until_write() {
        let pipes = set();
        let slot = pipes.allocate().unwrap();
        let reader = {
            let pipes = Arc::clone(&pipes);
            std::thread::spawn(move || {
                let mut buf = [0u8; 64];
                let n = pipes.read(slot, &mut buf).unwrap();
                buf[..n].to_vec()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        pipes.write(slot, b"wake").unwrap();
        assert_eq!(reader.join().unwrap(), b"wake");
    }

    #[test]
    fn test_close_write_end_is_eof() {
        let pipes = set();
        let slot = pipes.allocate().unwrap();
        pipes.close_end(slot, PipeEnd::Write).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(pipes.read(slot, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_clamped_to_capacity() {
        let pipes = set();
        let slot = pipes.allocate().unwrap();
        let n = pipes.write(slot, &[0u8; 1000]).unwrap();
        assert_eq!(n, 64);
    }

    #[test]
    fn test_slot_exhaustion_and_recycle() {
        let pipes = set();
        let a = pipes.allocate().unwrap();
        let _b = pipes.allocate().unwrap();
        assert_eq!(pipes.allocate().unwrap_err(), Errno::ENFILE);
        pipes.close_end(a, PipeEnd::Read).unwrap();
        pipes.close_end(a, PipeEnd::Write).unwrap();
        assert_eq!(pipes.allocate().unwrap(), a);
    }

    #[test]
    fn test_closed_end_rejects_io() {
        let pipes = set();
        let slot = pipes.allocate().unwrap();
        pipes.close_end(slot, PipeEnd::Read).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(pipes.read(slot, &mut buf).unwrap_err(), Errno::EBADF);
        assert_eq!(pipes.write(slot, b"x").unwrap_err(), Errno::EPIPE);
    }
}
