//! Inter-cage messaging: datagram sockets with descriptor passing.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};

use log::*;
use nix::errno::Errno;

use crate::host::descriptor::Descriptor;

/// Most IOV entries one sendmsg/recvmsg call will honor.
pub const IMC_IOVEC_MAX: usize = 256;
/// Most descriptors one message may carry.
pub const IMC_DESC_MAX: usize = 8;
/// Per-queue backlog before senders block.
const QUEUE_DEPTH: usize = 16;

bitflags::bitflags! {
    /// Flag bits of the sendmsg/recvmsg ABI.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct ImcFlags: u32 {
        const DONT_WAIT = 0x1;
        const DATA_TRUNCATED = 0x2;
        const DESC_TRUNCATED = 0x4;
    }
}

/// One queued message: a byte payload plus the descriptors traveling with
/// it.
#[derive(Debug, Default)]
pub struct ImcMessage {
    pub bytes: Vec<u8>,
    pub descs: Vec<Descriptor>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<ImcMessage>,
    closed: bool,
}

/// A bounded one-directional message queue. The sending side's push is the
/// release edge and the receiving side's pop the acquire edge; both are
/// provided by the queue lock.
#[derive(Debug, Default)]
struct MessageQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl MessageQueue {
    fn push(&self, msg: ImcMessage, dont_wait: bool) -> Result<(), Errno> {
        let state = self.state.lock().unwrap();
        if state.closed {
            return Err(Errno::EPIPE);
        }
        if state.messages.len() >= QUEUE_DEPTH && dont_wait {
            return Err(Errno::EAGAIN);
        }
        let mut state = self
            .cond
            .wait_while(state, |s| !s.closed && s.messages.len() >= QUEUE_DEPTH)
            .unwrap();
        if state.closed {
            return Err(Errno::EPIPE);
        }
        state.messages.push_back(msg);
        self.cond.notify_all();
        Ok(())
    }

    fn pop(&self, dont_wait: bool) -> Result<ImcMessage, Errno> {
        let state = self.state.lock().unwrap();
        if state.messages.is_empty() {
            if state.closed {
                // end of stream
                return Ok(ImcMessage::default());
            }
            if dont_wait {
                return Err(Errno::EAGAIN);
            }
        }
        let mut state = self
            .cond
            .wait_while(state, |s| s.messages.is_empty() && !s.closed)
            .unwrap();
        match state.messages.pop_front() {
            Some(msg) => {
                self.cond.notify_all();
                Ok(msg)
            }
            None => Ok(ImcMessage::default()),
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// One endpoint of a connected socket pair.
#[derive(Debug)]
pub struct ConnectedSocketFile {
    send: Arc<MessageQueue>,
    recv: Arc<MessageQueue>,
}

impl ConnectedSocketFile {
    /// A fresh pair of connected endpoints.
    pub fn new_pair() -> (Self, Self) {
        let a_to_b = Arc::new(MessageQueue::default());
        let b_to_a = Arc::new(MessageQueue::default());
        (
            Self {
                send: Arc::clone(&a_to_b),
                recv: Arc::clone(&b_to_a),
            },
            Self {
                send: b_to_a,
                recv: a_to_b,
            },
        )
    }

    pub fn send_msg(&self, msg: ImcMessage, flags: ImcFlags) -> Result<usize, Errno> {
        if msg.descs.len() > IMC_DESC_MAX {
            return Err(Errno::EMSGSIZE);
        }
        let len = msg.bytes.len();
        self.send.push(msg, flags.contains(ImcFlags::DONT_WAIT))?;
        Ok(len)
    }

    pub fn recv_msg(&self, flags: ImcFlags) -> Result<ImcMessage, Errno> {
        self.recv.pop(flags.contains(ImcFlags::DONT_WAIT))
    }

    /// Byte-stream view for plain read: one message per call, truncated to
    /// the buffer; carried descriptors are dropped.
    pub fn read_stream(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let msg = self.recv.pop(false)?;
        if !msg.descs.is_empty() {
            debug!("dropping {} descriptors on byte-stream read", msg.descs.len());
        }
        let n = std::cmp::min(buf.len(), msg.bytes.len());
        buf[..n].copy_from_slice(&msg.bytes[..n]);
        Ok(n)
    }

    /// Byte-stream view for plain write.
    pub fn write_stream(&self, buf: &[u8]) -> Result<usize, Errno> {
        self.send.push(
            ImcMessage {
                bytes: buf.to_vec(),
                descs: Vec::new(),
            },
            false,
        )?;
        Ok(buf.len())
    }

    pub fn shutdown(&self) {
        self.send.close();
        self.recv.close();
    }
}

#[derive(Debug, Default)]
struct AcceptQueue {
    pending: VecDeque<ConnectedSocketFile>,
    closed: bool,
}

/// The accepting side of a rendezvous.
#[derive(Debug, Default)]
pub struct BoundSocketFile {
    state: Mutex<AcceptQueue>,
    cond: Condvar,
}

impl BoundSocketFile {
    /// A bound socket plus the capability used to connect to it.
    pub fn new_with_cap() -> (Arc<Self>, Arc<ConnCapFile>) {
        let bound = Arc::new(Self::default());
        let cap = Arc::new(ConnCapFile {
            acceptor: Arc::downgrade(&bound),
        });
        (bound, cap)
    }

    /// Block until a peer connects, returning the server-side endpoint.
    pub fn accept(&self) -> Result<ConnectedSocketFile, Errno> {
        let state = self.state.lock().unwrap();
        let mut state = self
            .cond
            .wait_while(state, |s| s.pending.is_empty() && !s.closed)
            .unwrap();
        state.pending.pop_front().ok_or(Errno::EINVAL)
    }

    fn enqueue(&self, endpoint: ConnectedSocketFile) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Errno::ECONNREFUSED);
        }
        state.pending.push_back(endpoint);
        self.cond.notify_one();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// A connect capability naming a bound socket, transferable between cages.
#[derive(Debug)]
pub struct ConnCapFile {
    acceptor: Weak<BoundSocketFile>,
}

impl ConnCapFile {
    /// Connect to the acceptor, returning the client-side endpoint.
    pub fn connect(&self) -> Result<ConnectedSocketFile, Errno> {
        let bound = self.acceptor.upgrade().ok_or(Errno::ECONNREFUSED)?;
        let (server, client) = ConnectedSocketFile::new_pair();
        bound.enqueue(server)?;
        Ok(client)
    }
}
