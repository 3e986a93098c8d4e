use log::*;
use nix::errno::Errno;

use crate::host::context::ThreadContext;
use crate::host::memory::{
    is_alloc_page_multiple, round_alloc_page, FileBacking, MapFlags, Prot, ALLOC_PAGE_SHIFT,
    PAGE_SHIFT,
};
use crate::host::module::ValidationPolicy;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult};

const ALLOC_PAGES: usize = 1 << (ALLOC_PAGE_SHIFT - PAGE_SHIFT);

impl SyscallHandler {
    /// Grow or shrink the data break. The return value is always the
    /// resulting break address; a refused request returns the old one.
    pub fn brk(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let new_break = usize::from(args.get(0));
        let cage = ctx.cage;

        let mut vm = cage.vm();
        let break_addr = vm.break_addr;

        trace!("brk(new_break {:#x}), current {:#x}", new_break, break_addr);

        if cage.mem().user_to_sys(new_break.into()).is_err() {
            return Ok(break_addr.into());
        }
        if new_break < vm.data_end {
            debug!("brk: new break below data_end {:#x}", vm.data_end);
            return Ok(break_addr.into());
        }
        if new_break <= vm.break_addr {
            // freeing memory
            vm.break_addr = new_break;
            return Ok(new_break.into());
        }

        let old_break = vm.break_addr;
        let usr_last_data_page = (old_break - 1) >> PAGE_SHIFT;
        let usr_new_last_data_page = (new_break - 1) >> PAGE_SHIFT;
        let last_internal_page = (round_alloc_page(new_break) - 1) >> PAGE_SHIFT;

        let ent = vm
            .map
            .find_page(usr_last_data_page)
            .unwrap_or_else(|| panic!("current break {:#x} not in address map", old_break));
        let (ent_page, ent_end) = (ent.page_num, ent.end_page());

        if usr_new_last_data_page < ent_end {
            trace!("brk: new break within break segment, just bumping addr");
            vm.break_addr = new_break;
        } else {
            // refuse if another mapping sits between us and the new end
            if let Some(next) = vm.map.iter().find(|e| e.page_num >= ent_end) {
                if next.page_num <= last_internal_page {
                    debug!(
                        "brk: request {:#x} runs into region at page {:#x}",
                        new_break, next.page_num
                    );
                    return Ok(break_addr.into());
                }
            }
            // extend the break segment and make the new pages accessible
            let start_new_region = ent_end << PAGE_SHIFT;
            let region_size = ((last_internal_page + 1) << PAGE_SHIFT) - start_new_region;
            cage.mem()
                .commit(start_new_region, region_size, Prot::READ | Prot::WRITE)
                .map_err(|_| Errno::ENOMEM)?;
            vm.map.add_with_overwrite(
                ent_page,
                last_internal_page + 1 - ent_page,
                Prot::READ | Prot::WRITE,
                None,
            );
            vm.break_addr = new_break;
        }

        // the cage sees zeroes in every newly reserved byte
        cage.mem()
            .zero(old_break, new_break - old_break)
            .expect("zeroing fresh break pages");

        trace!("brk: returning {:#x}", vm.break_addr);
        Ok(vm.break_addr.into())
    }

    pub fn mmap(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let start = usize::from(args.get(0));
        let length = usize::from(args.get(1));
        let prot = Prot::from_bits_truncate(u32::from(args.get(2)));
        let raw_flags = u32::from(args.get(3));
        let fd = i32::from(args.get(4));
        let offset = i64::from(args.get(5));

        let cage = ctx.cage;

        let flags = MapFlags::from_bits_truncate(raw_flags);
        if flags.bits() != raw_flags {
            debug!("mmap: ignoring extraneous flag bits {:#o}", raw_flags);
        }

        let file = if flags.contains(MapFlags::ANONYMOUS) {
            // backing store is just swap; no descriptor is involved
            None
        } else {
            Some(Self::get_file(cage, fd)?)
        };

        // dynamic code loading is the one legitimate use of PROT_EXEC
        let mapping_code = prot.contains(Prot::EXEC)
            && flags.contains(MapFlags::FIXED)
            && file.is_some()
            && cage.range_in_dynamic_text(start, length);
        if prot.contains(Prot::EXEC) && !mapping_code {
            return Err(Errno::EINVAL.into());
        }
        if mapping_code && prot.contains(Prot::WRITE) {
            debug!("mmap: asked for writable and executable code pages");
            return Err(Errno::EINVAL.into());
        }

        if !is_alloc_page_multiple(start) {
            debug!("mmap: address not allocation granularity aligned");
            return Err(Errno::EINVAL.into());
        }
        if offset < 0 || !is_alloc_page_multiple(offset as usize) {
            return Err(Errno::EINVAL.into());
        }
        if length == 0 {
            return Err(Errno::EINVAL.into());
        }
        let rounded_length = round_alloc_page(length);
        let npages = rounded_length >> PAGE_SHIFT;

        // how much of the file the mapping can actually see
        let file_bytes = match &file {
            Some(file) => {
                if !file.is_safe_for_mmap() {
                    return Err(Errno::ENODEV.into());
                }
                let size = file.stat()?.size;
                if offset >= size {
                    0
                } else {
                    std::cmp::min((size - offset) as usize, rounded_length)
                }
            }
            None => 0,
        };

        let mut vm = cage.vm();

        let place = if flags.contains(MapFlags::FIXED) {
            // the zero page is never a valid mapping target
            if start == 0 {
                return Err(Errno::EINVAL.into());
            }
            if cage.mem().user_to_sys_range(start.into(), rounded_length).is_err() {
                return Err(Errno::EFAULT.into());
            }
            start
        } else {
            let hole = if start != 0 {
                vm.map
                    .find_hole_aligned_above(start >> PAGE_SHIFT, npages, ALLOC_PAGES)
            } else {
                vm.map.find_hole_aligned(npages, ALLOC_PAGES)
            };
            match hole {
                Some(page) => page << PAGE_SHIFT,
                None => {
                    debug!("mmap: no address-space hole of {} pages", npages);
                    return Err(Errno::ENOMEM.into());
                }
            }
        };

        if mapping_code {
            let file = file.as_ref().unwrap();
            let mut code = vec![0u8; file_bytes];
            file.pread_all(&mut code, offset)?;
            let policy = ValidationPolicy {
                stubout_mode: false,
                readonly_text: true,
            };
            if ctx.runtime.validator().validate(&code, &policy)
                != crate::host::module::ValidationStatus::Ok
            {
                // the dynamic-code insertion interface is the fallback for
                // text the fast path refuses
                debug!("mmap: validator refused dynamic code");
                return Err(Errno::EINVAL.into());
            }
            vm = cage.vm_hole_open(vm, place, place + rounded_length - 1);
            let result = (|| {
                cage.mem()
                    .commit(place, rounded_length, Prot::READ | Prot::WRITE)?;
                cage.mem().copy_to_user(place.into(), &code)?;
                cage.mem()
                    .protect(place, rounded_length, Prot::READ | Prot::EXEC)
            })();
            cage.vm_hole_close(&mut vm);
            result.map_err(|_| Errno::ENOMEM)?;
            vm.map.add_with_overwrite(
                place >> PAGE_SHIFT,
                npages,
                Prot::READ | Prot::EXEC,
                Some(FileBacking {
                    file: (*file).clone(),
                    offset,
                    file_size: file_bytes as i64,
                }),
            );
            debug!(
                "mmap: installed {} bytes of validated code at {:#x}",
                file_bytes, place
            );
            return Ok(place.into());
        }

        vm = cage.vm_hole_open(vm, place, place + rounded_length - 1);
        let map_result = (|| -> Result<(), Errno> {
            match (&file, file.as_ref().and_then(|f| f.mappable_host_fd())) {
                // shared memory objects get a real shared host mapping
                (Some(_), Some(host_fd)) if flags.contains(MapFlags::SHARED) => {
                    let sys = cage.mem().user_to_sys_range(place.into(), rounded_length)?;
                    map_shared_fd(sys, rounded_length, prot, host_fd, offset)
                }
                (Some(file), _) => {
                    // private file mapping: land the visible bytes, leave
                    // the tail past end-of-file inaccessible
                    let file_alloc_bytes = round_alloc_page(file_bytes);
                    if file_alloc_bytes > 0 {
                        cage.mem()
                            .commit(place, file_alloc_bytes, Prot::READ | Prot::WRITE)?;
                    }
                    if file_bytes > 0 {
                        let mut data = vec![0u8; file_bytes];
                        file.pread_all(&mut data, offset)?;
                        cage.mem().copy_to_user(place.into(), &data)?;
                    }
                    if file_alloc_bytes > 0 && prot != (Prot::READ | Prot::WRITE) {
                        cage.mem().protect(place, file_alloc_bytes, prot)?;
                    }
                    if rounded_length > file_alloc_bytes {
                        cage.mem()
                            .discard(place + file_alloc_bytes, rounded_length - file_alloc_bytes)?;
                    }
                    Ok(())
                }
                (None, _) => cage.mem().commit(place, rounded_length, prot),
            }
        })();
        cage.vm_hole_close(&mut vm);
        map_result.map_err(|e| if e == Errno::EFAULT { e } else { Errno::ENOMEM })?;

        vm.map.add_with_overwrite(
            place >> PAGE_SHIFT,
            npages,
            prot,
            file.map(|file| FileBacking {
                file,
                offset,
                file_size: file_bytes as i64,
            }),
        );

        if flags.contains(MapFlags::FIXED) && place != start {
            panic!("mmap: fixed mapping landed at {:#x}, not {:#x}", place, start);
        }

        trace!("mmap: {:#x}..{:#x} prot {:?}", place, place + rounded_length, prot);
        Ok(place.into())
    }

    pub fn munmap(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let start = usize::from(args.get(0));
        let length = usize::from(args.get(1));

        let cage = ctx.cage;

        if !is_alloc_page_multiple(start) {
            debug!("munmap: start addr not allocation multiple");
            return Err(Errno::EINVAL.into());
        }
        if length == 0 {
            return Err(Errno::EINVAL.into());
        }
        let length = round_alloc_page(length);
        cage.mem().user_to_sys_range(start.into(), length)?;

        // the cage must never unmap its own text
        if cage.range_contains_executable_pages(start, length) {
            debug!("munmap: region contains executable pages");
            return Err(Errno::EINVAL.into());
        }

        let vm = cage.vm();
        let mut vm = cage.vm_hole_open(vm, start, start + length - 1);
        let result = cage.mem().discard(start, length);
        cage.vm_hole_close(&mut vm);
        result?;
        vm.map.remove(start >> PAGE_SHIFT, length >> PAGE_SHIFT);

        Ok(0u32.into())
    }

    pub fn mprotect(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let start = usize::from(args.get(0));
        let length = usize::from(args.get(1));
        let raw_prot = u32::from(args.get(2));

        let cage = ctx.cage;

        if !is_alloc_page_multiple(start) {
            debug!("mprotect: start addr not allocation multiple");
            return Err(Errno::EINVAL.into());
        }
        let length = round_alloc_page(length);
        cage.mem().user_to_sys_range(start.into(), length)?;
        if raw_prot & !(Prot::READ | Prot::WRITE).bits() != 0 {
            debug!("mprotect: prot has other bits than PROT_READ|PROT_WRITE");
            return Err(Errno::EACCES.into());
        }
        let prot = Prot::from_bits_truncate(raw_prot);

        let mut vm = cage.vm();
        let (page, npages) = (start >> PAGE_SHIFT, length >> PAGE_SHIFT);
        if !vm.map.check_existing(page, npages, Prot::empty()) {
            debug!("mprotect: no such region");
            return Err(Errno::EACCES.into());
        }
        if cage.range_contains_executable_pages(start, length) {
            debug!("mprotect: region contains executable pages");
            return Err(Errno::EACCES.into());
        }

        // apply the host change per covered sub-interval
        let spans: Vec<(usize, usize)> = vm
            .map
            .iter()
            .filter(|e| e.page_num < page + npages && e.end_page() > page)
            .map(|e| {
                let first = e.page_num.max(page);
                let last = e.end_page().min(page + npages);
                (first << PAGE_SHIFT, (last - first) << PAGE_SHIFT)
            })
            .collect();
        for (span_start, span_len) in spans {
            cage.mem()
                .protect(span_start, span_len, prot)
                .map_err(|_| Errno::EACCES)?;
        }

        if !vm.map.change_prot(page, npages, prot) {
            return Err(Errno::EACCES.into());
        }
        Ok(0u32.into())
    }
}

fn map_shared_fd(
    sys: *mut u8,
    len: usize,
    prot: Prot,
    host_fd: std::os::fd::RawFd,
    offset: i64,
) -> Result<(), Errno> {
    use std::num::NonZeroUsize;
    use std::os::fd::BorrowedFd;

    use nix::sys::mman;

    // Safety: the fd is owned by a live ShmFile resolved from the caller's
    // descriptor table for the duration of this call.
    let fd = unsafe { BorrowedFd::borrow_raw(host_fd) };
    unsafe {
        mman::mmap(
            Some(NonZeroUsize::new(sys as usize).unwrap()),
            NonZeroUsize::new(len).ok_or(Errno::EINVAL)?,
            prot.as_host(),
            mman::MapFlags::MAP_SHARED | mman::MapFlags::MAP_FIXED,
            fd,
            offset,
        )
    }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::syscall::numbers::*;
    use crate::host::testing::{test_options, Caller};

    fn errno(e: Errno) -> i32 {
        -(e as i32)
    }

    fn mmap_anon(caller: &Caller, len: usize, prot: Prot) -> i32 {
        caller.ctx().syscall6(
            SYS_MMAP,
            0usize,
            len,
            prot.bits(),
            (MapFlags::PRIVATE | MapFlags::ANONYMOUS).bits(),
            -1i32,
            0i64,
        )
    }

    #[test]
    fn test_mmap_munmap_round_trip() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let len = 0x20000usize;

        let usr = mmap_anon(&caller, len, Prot::READ | Prot::WRITE);
        assert!(usr > 0);
        assert_eq!(usr as usize % crate::host::memory::ALLOC_PAGE_SIZE, 0);

        assert_eq!(
            ctx.syscall6(SYS_MPROTECT, usr as usize, len, Prot::READ.bits(), 0u64, 0u64, 0u64),
            0
        );
        assert_eq!(
            ctx.syscall6(SYS_MUNMAP, usr as usize, len, 0u64, 0u64, 0u64, 0u64),
            0
        );
        // the region is gone now
        assert_eq!(
            ctx.syscall6(SYS_MPROTECT, usr as usize, len, Prot::READ.bits(), 0u64, 0u64, 0u64),
            errno(Errno::EACCES)
        );
    }

    #[test]
    fn test_mmap_fixed_lands_exactly() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let start = 0x200000usize;
        let rv = ctx.syscall6(
            SYS_MMAP,
            start,
            0x10000usize,
            (Prot::READ | Prot::WRITE).bits(),
            (MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED).bits(),
            -1i32,
            0i64,
        );
        assert_eq!(rv as usize, start);
        // and is writable
        caller
            .cage
            .mem()
            .copy_to_user(start.into(), b"fixed")
            .unwrap();
    }

    #[test]
    fn test_mmap_rejects_bad_arguments() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let anon = (MapFlags::PRIVATE | MapFlags::ANONYMOUS).bits();

        // unaligned hint
        assert_eq!(
            ctx.syscall6(
                SYS_MMAP,
                0x1234usize,
                0x10000usize,
                Prot::READ.bits(),
                anon | MapFlags::FIXED.bits(),
                -1i32,
                0i64
            ),
            errno(Errno::EINVAL)
        );
        // zero length
        assert_eq!(
            ctx.syscall6(SYS_MMAP, 0usize, 0usize, Prot::READ.bits(), anon, -1i32, 0i64),
            errno(Errno::EINVAL)
        );
        // unaligned offset
        assert_eq!(
            ctx.syscall6(
                SYS_MMAP,
                0usize,
                0x10000usize,
                Prot::READ.bits(),
                anon,
                -1i32,
                0x200i64
            ),
            errno(Errno::EINVAL)
        );
        // exec outside the dynamic-text region
        assert_eq!(
            ctx.syscall6(
                SYS_MMAP,
                0usize,
                0x10000usize,
                (Prot::READ | Prot::EXEC).bits(),
                anon,
                -1i32,
                0i64
            ),
            errno(Errno::EINVAL)
        );
        // file-backed mapping with a bogus fd
        assert_eq!(
            ctx.syscall6(
                SYS_MMAP,
                0usize,
                0x10000usize,
                Prot::READ.bits(),
                MapFlags::PRIVATE.bits(),
                99i32,
                0i64
            ),
            errno(Errno::EBADF)
        );
    }

    #[test]
    fn test_munmap_refuses_executable_range() {
        let caller = Caller::new(test_options());
        caller.cage.set_dynamic_text(0x100000..0x120000);
        assert_eq!(
            caller
                .ctx()
                .syscall6(SYS_MUNMAP, 0x100000usize, 0x10000usize, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EINVAL)
        );
    }

    #[test]
    fn test_mmap_validated_code_into_dynamic_text() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let text_start = 0x100000usize;
        caller.cage.set_dynamic_text(text_start..text_start + 0x20000);

        let shm_fd = ctx.syscall6(SYS_IMC_MEM_OBJ_CREATE, 0x10000usize, 0u64, 0u64, 0u64, 0u64, 0u64);
        assert!(shm_fd >= 0);

        let rv = ctx.syscall6(
            SYS_MMAP,
            text_start,
            0x10000usize,
            (Prot::READ | Prot::EXEC).bits(),
            (MapFlags::SHARED | MapFlags::FIXED).bits(),
            shm_fd,
            0i64,
        );
        assert_eq!(rv as usize, text_start);

        // text is sealed: no mprotect, no munmap
        assert_eq!(
            ctx.syscall6(
                SYS_MPROTECT,
                text_start,
                0x10000usize,
                (Prot::READ | Prot::WRITE).bits(),
                0u64,
                0u64,
                0u64
            ),
            errno(Errno::EACCES)
        );
        assert_eq!(
            ctx.syscall6(SYS_MUNMAP, text_start, 0x10000usize, 0u64, 0u64, 0u64, 0u64),
            errno(Errno::EINVAL)
        );
    }

    #[test]
    fn test_brk_growth_and_contraction() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let data_end = caller.cage.vm().data_end;

        // brk(0) just reports the current break
        assert_eq!(ctx.syscall6(SYS_BRK, 0usize, 0u64, 0u64, 0u64, 0u64, 0u64) as usize, data_end);

        let grown = data_end + 0x1000;
        assert_eq!(
            ctx.syscall6(SYS_BRK, grown, 0u64, 0u64, 0u64, 0u64, 0u64) as usize,
            grown
        );
        // fresh break memory reads as zeroes and is writable
        let mut buf = [1u8; 16];
        caller.cage.mem().copy_from_user(&mut buf, data_end.into()).unwrap();
        assert_eq!(buf, [0u8; 16]);
        caller.cage.mem().copy_to_user(data_end.into(), b"abc").unwrap();

        let contracted = data_end + 0x800;
        assert_eq!(
            ctx.syscall6(SYS_BRK, contracted, 0u64, 0u64, 0u64, 0u64, 0u64) as usize,
            contracted
        );
        // below data_end: refused, the break stays put
        assert_eq!(
            ctx.syscall6(SYS_BRK, data_end - 1, 0u64, 0u64, 0u64, 0u64, 0u64) as usize,
            contracted
        );
    }

    #[test]
    fn test_brk_blocked_by_neighbor_mapping() {
        let caller = Caller::new(test_options());
        let ctx = caller.ctx();
        let data_end = caller.cage.vm().data_end;

        // park a mapping directly above the break segment
        let rv = ctx.syscall6(
            SYS_MMAP,
            data_end,
            0x10000usize,
            Prot::READ.bits(),
            (MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED).bits(),
            -1i32,
            0i64,
        );
        assert_eq!(rv as usize, data_end);

        // growth into it is refused; the break is unchanged
        assert_eq!(
            ctx.syscall6(SYS_BRK, data_end + 0x10000, 0u64, 0u64, 0u64, 0u64, 0u64) as usize,
            data_end
        );
    }
}
