use std::sync::Arc;

use log::*;
use nix::errno::Errno;

use crate::host::context::ThreadContext;
use crate::host::descriptor::imc::{ImcFlags, ImcMessage, IMC_DESC_MAX, IMC_IOVEC_MAX};
use crate::host::descriptor::{
    BoundSocketFile, ConnectedSocketFile, Descriptor, FileHandle, ShmFile,
};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult, UserArrayPtr, UserPtr};

/// The fd value untrusted code uses for "no descriptor".
const USER_INVALID_DESC: i32 = -1;

/// Message header of the sendmsg/recvmsg ABI. Pointer fields are 32-bit
/// user addresses.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
struct AbiImcMsgHdr {
    iov: u32,
    iov_length: u32,
    descv: u32,
    desc_length: u32,
    flags: u32,
}

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct AbiIoVec {
    base: u32,
    length: u32,
}

impl SyscallHandler {
    pub fn imc_makeboundsock(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let out_ptr = UserPtr::from(args.get(0));

        ctx.cage
            .mem()
            .user_to_sys_range(out_ptr, 2 * std::mem::size_of::<u32>())?;

        let (bound, cap) = BoundSocketFile::new_with_cap();
        let (sock_fd, cap_fd) = {
            let mut table = ctx.cage.descriptors();
            let sock_fd = table.add(Descriptor::new(FileHandle::BoundSocket(bound)), 0);
            let cap_fd = table.add(Descriptor::new(FileHandle::ConnCap(cap)), 0);
            (sock_fd, cap_fd)
        };
        let fds = [sock_fd, cap_fd];
        if let Err(e) = ctx.cage.mem().write_val(out_ptr, &fds) {
            let mut table = ctx.cage.descriptors();
            table.remove(sock_fd);
            table.remove(cap_fd);
            return Err(e.into());
        }
        Ok(0u32.into())
    }

    pub fn imc_accept(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));

        let file = Self::get_file(ctx.cage, fd)?;
        let endpoint = file.as_bound_socket()?.accept()?;
        let handle = FileHandle::ConnectedSocket(Arc::new(endpoint));
        let new_fd = ctx.cage.descriptors().add(Descriptor::new(handle), 0);
        Ok(new_fd.into())
    }

    pub fn imc_connect(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));

        let file = Self::get_file(ctx.cage, fd)?;
        let endpoint = file.as_conn_cap()?.connect()?;
        let handle = FileHandle::ConnectedSocket(Arc::new(endpoint));
        let new_fd = ctx.cage.descriptors().add(Descriptor::new(handle), 0);
        Ok(new_fd.into())
    }

    pub fn imc_socketpair(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let out_ptr = UserPtr::from(args.get(0));

        ctx.cage
            .mem()
            .user_to_sys_range(out_ptr, 2 * std::mem::size_of::<u32>())?;

        let (a, b) = ConnectedSocketFile::new_pair();
        let (fd_a, fd_b) = {
            let mut table = ctx.cage.descriptors();
            let fd_a = table.add(
                Descriptor::new(FileHandle::ConnectedSocket(Arc::new(a))),
                0,
            );
            let fd_b = table.add(
                Descriptor::new(FileHandle::ConnectedSocket(Arc::new(b))),
                0,
            );
            (fd_a, fd_b)
        };
        let fds = [fd_a, fd_b];
        if let Err(e) = ctx.cage.mem().write_val(out_ptr, &fds) {
            let mut table = ctx.cage.descriptors();
            table.remove(fd_a);
            table.remove(fd_b);
            return Err(e.into());
        }
        Ok(0u32.into())
    }

    pub fn imc_mem_obj_create(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let size = usize::from(args.get(0));

        let shm = ShmFile::new(size)?;
        let fd = ctx
            .cage
            .descriptors()
            .add(Descriptor::new(FileHandle::Shm(Arc::new(shm))), 0);
        Ok(fd.into())
    }

    // Copy the header and IOV array into trusted memory before translating
    // anything; the user must not be able to swap them mid-call.
    fn copy_msg_hdr(
        ctx: &ThreadContext,
        msg_ptr: UserPtr,
    ) -> Result<(AbiImcMsgHdr, Vec<AbiIoVec>), Errno> {
        let hdr: AbiImcMsgHdr = ctx.cage.mem().read_val(msg_ptr)?;
        if hdr.iov_length as usize > IMC_IOVEC_MAX {
            return Err(Errno::EINVAL);
        }
        if hdr.desc_length as usize > IMC_DESC_MAX {
            return Err(Errno::EINVAL);
        }
        let iovs = ctx.cage.mem().read_vals(UserArrayPtr::<AbiIoVec>::new(
            UserPtr::from(hdr.iov as usize),
            hdr.iov_length as usize,
        ))?;
        Ok((hdr, iovs))
    }

    pub fn imc_sendmsg(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let msg_ptr = UserPtr::from(args.get(1));
        let flags = ImcFlags::from_bits_truncate(u32::from(args.get(2)));

        let socket = Self::get_file(ctx.cage, fd)?;
        let socket = socket.as_connected_socket()?;

        let (hdr, iovs) = Self::copy_msg_hdr(ctx, msg_ptr)?;

        // gather the payload through per-IOV translation
        let mut bytes = Vec::new();
        for iov in &iovs {
            let len = iov.length as usize;
            let at = bytes.len();
            bytes.resize(at + len, 0);
            ctx.cage
                .mem()
                .copy_from_user(&mut bytes[at..], UserPtr::from(iov.base as usize))?;
        }

        // marshal descriptor numbers into references
        let desc_fds = ctx.cage.mem().read_vals(UserArrayPtr::<i32>::new(
            UserPtr::from(hdr.descv as usize),
            hdr.desc_length as usize,
        ))?;
        let mut descs = Vec::with_capacity(desc_fds.len());
        for &desc_fd in &desc_fds {
            if desc_fd == USER_INVALID_DESC {
                descs.push(Descriptor::new(FileHandle::invalid()));
            } else {
                descs.push(Self::get_descriptor(ctx.cage, desc_fd)?);
            }
        }

        let sent = socket.send_msg(ImcMessage { bytes, descs }, flags)?;
        trace!("imc_sendmsg: sent {} bytes", sent);
        Ok(sent.into())
    }

    pub fn imc_recvmsg(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let fd = i32::from(args.get(0));
        let msg_ptr = UserPtr::from(args.get(1));
        let flags = ImcFlags::from_bits_truncate(u32::from(args.get(2)));

        let socket = Self::get_file(ctx.cage, fd)?;
        let socket = socket.as_connected_socket()?;

        let (mut hdr, iovs) = Self::copy_msg_hdr(ctx, msg_ptr)?;

        let msg = socket.recv_msg(flags)?;

        // scatter the payload
        let mut copied = 0;
        for iov in &iovs {
            if copied == msg.bytes.len() {
                break;
            }
            let n = std::cmp::min(iov.length as usize, msg.bytes.len() - copied);
            ctx.cage
                .mem()
                .copy_to_user(UserPtr::from(iov.base as usize), &msg.bytes[copied..copied + n])?;
            copied += n;
        }
        let mut out_flags = ImcFlags::empty();
        if copied < msg.bytes.len() {
            out_flags |= ImcFlags::DATA_TRUNCATED;
        }

        // land the carried descriptors; anything past the caller's vector
        // is dropped
        let room = hdr.desc_length as usize;
        let mut landed = Vec::new();
        for (i, desc) in msg.descs.into_iter().enumerate() {
            if i >= room {
                out_flags |= ImcFlags::DESC_TRUNCATED;
                break;
            }
            landed.push(ctx.cage.descriptors().add(desc, 0) as i32);
        }
        if !landed.is_empty() {
            ctx.cage.mem().write_vals(
                UserArrayPtr::<i32>::new(UserPtr::from(hdr.descv as usize), room),
                &landed,
            )?;
        }

        hdr.desc_length = landed.len() as u32;
        hdr.flags = out_flags.bits();
        ctx.cage.mem().write_val(msg_ptr, &hdr)?;

        trace!(
            "imc_recvmsg: {} bytes, {} descriptors",
            copied,
            hdr.desc_length
        );
        Ok(copied.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::syscall::numbers::*;
    use crate::host::testing::{test_options, Caller};

    fn errno(e: Errno) -> i32 {
        -(e as i32)
    }

    fn socketpair(caller: &Caller) -> (i32, i32) {
        let out = caller.data_addr(0x40);
        assert_eq!(
            caller
                .ctx()
                .syscall6(SYS_IMC_SOCKETPAIR, out, 0u64, 0u64, 0u64, 0u64, 0u64),
            0
        );
        let fds: [u32; 2] = caller.cage.mem().read_val(out.into()).unwrap();
        (fds[0] as i32, fds[1] as i32)
    }

    // lay out a message header at `hdr_at` pointing at one iov and a
    // descriptor vector
    fn put_hdr(
        caller: &Caller,
        hdr_at: usize,
        iov_at: usize,
        data_at: usize,
        data_len: usize,
        descv_at: usize,
        desc_len: usize,
    ) {
        let mem = caller.cage.mem();
        mem.write_val(
            iov_at.into(),
            &AbiIoVec {
                base: data_at as u32,
                length: data_len as u32,
            },
        )
        .unwrap();
        mem.write_val(
            hdr_at.into(),
            &AbiImcMsgHdr {
                iov: iov_at as u32,
                iov_length: 1,
                descv: descv_at as u32,
                desc_length: desc_len as u32,
                flags: 0,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_socketpair_send_recv() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let (a, b) = socketpair(&caller);

        let send_data = caller.data_addr(0x1000);
        caller.cage.mem().copy_to_user(send_data.into(), b"payload").unwrap();
        let hdr_at = caller.data_addr(0x100);
        put_hdr(&caller, hdr_at, caller.data_addr(0x140), send_data, 7, 0, 0);
        assert_eq!(
            ctx.syscall6(SYS_IMC_SENDMSG, a, hdr_at, 0u32, 0u64, 0u64, 0u64),
            7
        );

        let recv_data = caller.data_addr(0x2000);
        let recv_hdr = caller.data_addr(0x200);
        put_hdr(&caller, recv_hdr, caller.data_addr(0x240), recv_data, 64, 0, 0);
        assert_eq!(
            ctx.syscall6(SYS_IMC_RECVMSG, b, recv_hdr, 0u32, 0u64, 0u64, 0u64),
            7
        );
        let mut got = [0u8; 7];
        caller.cage.mem().copy_from_user(&mut got, recv_data.into()).unwrap();
        assert_eq!(&got, b"payload");
    }

    #[test]
    fn test_recvmsg_dont_wait() {
        let caller = Caller::new(test_options());
        let (a, _b) = socketpair(&caller);

        let recv_hdr = caller.data_addr(0x200);
        put_hdr(&caller, recv_hdr, caller.data_addr(0x240), caller.data_addr(0x2000), 64, 0, 0);
        assert_eq!(
            caller.ctx().syscall6(
                SYS_IMC_RECVMSG,
                a,
                recv_hdr,
                ImcFlags::DONT_WAIT.bits(),
                0u64,
                0u64,
                0u64
            ),
            errno(Errno::EAGAIN)
        );
    }

    #[test]
    fn test_descriptor_passing_installs_fresh_fd() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let (a, b) = socketpair(&caller);

        // pass a semaphore across
        let sem_fd = ctx.syscall6(SYS_SEM_CREATE, 5u32, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(sem_fd > 0);

        let descv_at = caller.data_addr(0x300);
        caller.cage.mem().write_vals(
            UserArrayPtr::<i32>::new(UserPtr::from(descv_at), 1),
            &[sem_fd],
        )
        .unwrap();

        let hdr_at = caller.data_addr(0x100);
        let data_at = caller.data_addr(0x1000);
        caller.cage.mem().copy_to_user(data_at.into(), b"d").unwrap();
        put_hdr(&caller, hdr_at, caller.data_addr(0x140), data_at, 1, descv_at, 1);
        assert_eq!(
            ctx.syscall6(SYS_IMC_SENDMSG, a, hdr_at, 0u32, 0u64, 0u64, 0u64),
            1
        );

        let recv_hdr = caller.data_addr(0x200);
        let recv_descv = caller.data_addr(0x400);
        put_hdr(
            &caller,
            recv_hdr,
            caller.data_addr(0x240),
            caller.data_addr(0x2000),
            16,
            recv_descv,
            IMC_DESC_MAX,
        );
        assert_eq!(
            ctx.syscall6(SYS_IMC_RECVMSG, b, recv_hdr, 0u32, 0u64, 0u64, 0u64),
            1
        );
        let hdr_out: AbiImcMsgHdr = caller.cage.mem().read_val(recv_hdr.into()).unwrap();
        assert_eq!(hdr_out.desc_length, 1);
        let landed: i32 = caller.cage.mem().read_val(recv_descv.into()).unwrap();
        assert_ne!(landed, sem_fd);

        // the landed fd names the same semaphore
        assert_eq!(
            ctx.syscall6(SYS_SEM_GET_VALUE, landed, 0u64, 0u64, 0u64, 0u64, 0u64),
            5
        );
    }

    #[test]
    fn test_bound_sock_connect_accept() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();

        let out = caller.data_addr(0x40);
        assert_eq!(
            ctx.syscall6(SYS_IMC_MAKEBOUNDSOCK, out, 0u64, 0u64, 0u64, 0u64, 0u64),
            0
        );
        let fds: [u32; 2] = caller.cage.mem().read_val(out.into()).unwrap();
        let (bound_fd, cap_fd) = (fds[0] as i32, fds[1] as i32);

        let client_fd = ctx.syscall6(SYS_IMC_CONNECT, cap_fd, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(client_fd > 0);
        let server_fd = ctx.syscall6(SYS_IMC_ACCEPT, bound_fd, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(server_fd > 0);

        // the pair is wired up: a stream write on one side arrives on the
        // other
        let msg_at = caller.data_addr(0x1000);
        caller.cage.mem().copy_to_user(msg_at.into(), b"hi").unwrap();
        assert_eq!(ctx.syscall6(SYS_WRITE, client_fd, msg_at, 2usize, 0u64, 0u64, 0u64), 2);
        let buf_at = caller.data_addr(0x2000);
        assert_eq!(ctx.syscall6(SYS_READ, server_fd, buf_at, 8usize, 0u64, 0u64, 0u64), 2);
    }

    #[test]
    fn test_mem_obj_create() {
        let caller = Caller::new(test_options());
        let fd = caller.ctx().syscall6(
            SYS_IMC_MEM_OBJ_CREATE,
            1000usize,
            0u64,
            0u64,
            0u64,
            0u64,
            0u64,
        );
        assert!(fd >= 3);
        assert_eq!(
            caller
                .ctx()
                .syscall6(SYS_IMC_MEM_OBJ_CREATE, 0usize, 0u64, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EINVAL)
        );
    }
}
