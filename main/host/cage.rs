//! A cage: one sandboxed module instance and everything it owns.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::Context;
use log::*;
use nix::errno::Errno;

use crate::host::descriptor::table::DescriptorTable;
use crate::host::descriptor::{Descriptor, FileHandle, FileMode, HostIoFile};
use crate::host::memory::{AddressSpace, VmMap, PAGE_SHIFT};
use crate::host::module::ModuleImage;
use crate::host::thread::CageThread;

/// Identifies a cage. Nonzero, unique for the life of the runtime, never
/// recycled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CageId(u32);

impl CageId {
    pub fn new(id: u32) -> Self {
        assert!(id != 0);
        Self(id)
    }
}

impl From<CageId> for u32 {
    fn from(id: CageId) -> u32 {
        id.0
    }
}

impl std::fmt::Display for CageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    Loading,
    Running,
    Exiting,
}

/// The address-space bookkeeping guarded by the cage lock.
pub struct VmState {
    pub map: VmMap,
    pub break_addr: usize,
    pub data_end: usize,
    // open while munmap has pages transiently unmapped
    hole_open: bool,
    // user ranges with copies in flight, blocking munmap
    io_pending: Vec<(usize, usize)>,
}

struct LifeState {
    run_state: RunState,
    exit_status: Option<i32>,
}

struct ExceptionState {
    handler_addr: usize,
    stack_addr: usize,
}

/// Whether a fork is mid-flight in this cage. Only the forking thread
/// manipulates it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ForkState {
    Idle,
    Forking,
}

pub struct Cage {
    id: CageId,
    // reparented by exec replacement, hence a lock
    parent_id: Mutex<Option<CageId>>,
    mem: AddressSpace,
    stack_size: usize,
    enable_exception_handling: bool,

    vm: Mutex<VmState>,
    vm_cond: Condvar,

    descriptors: Mutex<DescriptorTable>,

    threads: Mutex<Vec<Option<Arc<CageThread>>>>,

    children: Mutex<Vec<CageId>>,
    pub(crate) children_cond: Condvar,

    life: Mutex<LifeState>,
    exit_cond: Condvar,

    module: RwLock<Option<Arc<dyn ModuleImage>>>,
    binary_path: RwLock<Option<String>>,
    dynamic_text: Mutex<Range<usize>>,
    exception: Mutex<ExceptionState>,
    name_service: Mutex<FileHandle>,
    cwd: Mutex<PathBuf>,
    fork_state: Mutex<ForkState>,
}

impl Cage {
    pub fn new(
        id: CageId,
        parent_id: Option<CageId>,
        addr_bits: u32,
        stack_size: usize,
        enable_exception_handling: bool,
    ) -> anyhow::Result<Self> {
        let mem = AddressSpace::new(addr_bits)
            .with_context(|| format!("creating address window for cage {id}"))?;
        let num_pages = mem.num_pages();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let cage = Self {
            id,
            parent_id: Mutex::new(parent_id),
            mem,
            stack_size,
            enable_exception_handling,
            vm: Mutex::new(VmState {
                map: VmMap::new(num_pages),
                break_addr: 0,
                data_end: 0,
                hole_open: false,
                io_pending: Vec::new(),
            }),
            vm_cond: Condvar::new(),
            descriptors: Mutex::new(DescriptorTable::new()),
            threads: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            children_cond: Condvar::new(),
            life: Mutex::new(LifeState {
                run_state: RunState::Loading,
                exit_status: None,
            }),
            exit_cond: Condvar::new(),
            module: RwLock::new(None),
            binary_path: RwLock::new(None),
            dynamic_text: Mutex::new(0..0),
            exception: Mutex::new(ExceptionState {
                handler_addr: 0,
                stack_addr: 0,
            }),
            name_service: Mutex::new(FileHandle::invalid()),
            cwd: Mutex::new(cwd),
            fork_state: Mutex::new(ForkState::Idle),
        };
        cage.install_std_descriptors()?;
        Ok(cage)
    }

    // The standard descriptors every cage starts with: stdin on the null
    // device, stdout/stderr on duplicates of the runtime's.
    fn install_std_descriptors(&self) -> anyhow::Result<()> {
        use std::os::fd::FromRawFd;

        let mut table = self.descriptors.lock().unwrap();
        let stdin = std::fs::File::open("/dev/null").context("opening stdin device")?;
        let stdin = HostIoFile::from_std(stdin, FileMode::READ, PathBuf::from("/dev/null"));
        assert_eq!(table.add(Descriptor::new(host_io_handle(stdin)), 0), 0);

        for (host_fd, fd) in [(libc::STDOUT_FILENO, 1u32), (libc::STDERR_FILENO, 2u32)] {
            let duped = unsafe { libc::dup(host_fd) };
            if duped < 0 {
                anyhow::bail!("duplicating host fd {host_fd}");
            }
            let file = unsafe { std::fs::File::from_raw_fd(duped) };
            let file = HostIoFile::from_std(
                file,
                FileMode::WRITE,
                PathBuf::from(format!("<host fd {host_fd}>")),
            );
            assert_eq!(table.add(Descriptor::new(host_io_handle(file)), 0), fd);
        }
        Ok(())
    }

    pub fn id(&self) -> CageId {
        self.id
    }

    pub fn parent_id(&self) -> Option<CageId> {
        *self.parent_id.lock().unwrap()
    }

    pub fn set_parent_id(&self, parent: Option<CageId>) {
        *self.parent_id.lock().unwrap() = parent;
    }

    pub fn mem(&self) -> &AddressSpace {
        &self.mem
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn exception_handling_enabled(&self) -> bool {
        self.enable_exception_handling
    }

    pub fn vm(&self) -> MutexGuard<'_, VmState> {
        self.vm.lock().unwrap()
    }

    pub fn descriptors(&self) -> MutexGuard<'_, DescriptorTable> {
        self.descriptors.lock().unwrap()
    }

    pub fn module(&self) -> Option<Arc<dyn ModuleImage>> {
        self.module.read().unwrap().clone()
    }

    pub fn set_module(&self, module: Arc<dyn ModuleImage>) {
        *self.module.write().unwrap() = Some(module);
    }

    pub fn binary_path(&self) -> Option<String> {
        self.binary_path.read().unwrap().clone()
    }

    pub fn set_binary_path(&self, path: String) {
        *self.binary_path.write().unwrap() = Some(path);
    }

    pub fn dynamic_text(&self) -> Range<usize> {
        self.dynamic_text.lock().unwrap().clone()
    }

    pub fn set_dynamic_text(&self, range: Range<usize>) {
        *self.dynamic_text.lock().unwrap() = range;
    }

    /// Whether `[start, start + len)` lies entirely inside the dynamic-text
    /// region.
    pub fn range_in_dynamic_text(&self, start: usize, len: usize) -> bool {
        let text = self.dynamic_text();
        match start.checked_add(len) {
            Some(end) => start >= text.start && end <= text.end,
            None => false,
        }
    }

    /// Whether `[start, start + len)` overlaps any executable pages.
    pub fn range_contains_executable_pages(&self, start: usize, len: usize) -> bool {
        let text = self.dynamic_text();
        let end = start.saturating_add(len);
        start < text.end && end > text.start
    }

    pub fn cwd(&self) -> PathBuf {
        self.cwd.lock().unwrap().clone()
    }

    pub fn set_cwd(&self, path: PathBuf) {
        *self.cwd.lock().unwrap() = path;
    }

    pub fn name_service(&self) -> FileHandle {
        self.name_service.lock().unwrap().clone()
    }

    pub fn set_name_service(&self, cap: FileHandle) {
        *self.name_service.lock().unwrap() = cap;
    }

    pub fn fork_state(&self) -> ForkState {
        *self.fork_state.lock().unwrap()
    }

    /// Mark a fork as in flight. Fails if one already is; the snapshot
    /// must not race another snapshot of the same cage.
    pub fn begin_fork(&self) -> Result<(), Errno> {
        let mut state = self.fork_state.lock().unwrap();
        if *state == ForkState::Forking {
            return Err(Errno::EAGAIN);
        }
        *state = ForkState::Forking;
        Ok(())
    }

    pub fn end_fork(&self) {
        let mut state = self.fork_state.lock().unwrap();
        debug_assert_eq!(*state, ForkState::Forking);
        *state = ForkState::Idle;
    }

    pub fn exception_handler_addr(&self) -> usize {
        self.exception.lock().unwrap().handler_addr
    }

    /// Install a new handler, returning the previous one. Serialized with
    /// the debug stub's attachment by the caller holding the exception
    /// lock for the swap.
    pub fn swap_exception_handler(&self, addr: usize) -> usize {
        let mut exc = self.exception.lock().unwrap();
        std::mem::replace(&mut exc.handler_addr, addr)
    }

    pub fn exception_stack_addr(&self) -> usize {
        self.exception.lock().unwrap().stack_addr
    }

    pub fn set_exception_stack_addr(&self, addr: usize) {
        self.exception.lock().unwrap().stack_addr = addr;
    }

    // ---- threads ----

    /// Insert a thread, assigning the lowest free thread number.
    pub fn add_thread(&self, make: impl FnOnce(usize) -> Arc<CageThread>) -> Arc<CageThread> {
        let mut threads = self.threads.lock().unwrap();
        let num = threads
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or_else(|| {
                threads.push(None);
                threads.len() - 1
            });
        let thread = make(num);
        threads[num] = Some(Arc::clone(&thread));
        thread
    }

    /// Remove a thread from the table; true if it was the last one.
    pub fn remove_thread(&self, thread_num: usize) -> bool {
        let mut threads = self.threads.lock().unwrap();
        let slot = threads
            .get_mut(thread_num)
            .unwrap_or_else(|| panic!("thread {} not in cage {}", thread_num, self.id));
        assert!(slot.take().is_some(), "thread {} already removed", thread_num);
        threads.iter().all(|slot| slot.is_none())
    }

    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    // ---- children ----

    pub fn add_child(&self, child: CageId) {
        let mut children = self.children.lock().unwrap();
        debug_assert!(!children.contains(&child));
        children.push(child);
        self.children_cond.notify_all();
    }

    pub fn remove_child(&self, child: CageId) -> bool {
        let mut children = self.children.lock().unwrap();
        match children.iter().position(|&c| c == child) {
            Some(at) => {
                children.remove(at);
                self.children_cond.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn children(&self) -> Vec<CageId> {
        self.children.lock().unwrap().clone()
    }

    pub fn num_children(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Move all children onto `heir`, e.g. when exec replaces this cage.
    pub fn transfer_children_to(&self, heir: &Cage) {
        let mut ours = self.children.lock().unwrap();
        let mut theirs = heir.children.lock().unwrap();
        theirs.append(&mut ours);
        heir.children_cond.notify_all();
    }

    // ---- lifecycle ----

    pub fn run_state(&self) -> RunState {
        self.life.lock().unwrap().run_state
    }

    pub fn set_running(&self) {
        self.life.lock().unwrap().run_state = RunState::Running;
    }

    /// Record the cage's exit status. The first report wins; later ones
    /// (e.g. the launcher's default after an explicit exit syscall) are
    /// dropped.
    pub fn report_exit(&self, status: i32) {
        let mut life = self.life.lock().unwrap();
        life.run_state = RunState::Exiting;
        if life.exit_status.is_none() {
            debug!("cage {} exits with status {}", self.id, status);
            life.exit_status = Some(status);
        }
        self.exit_cond.notify_all();
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.life.lock().unwrap().exit_status
    }

    /// Wait until the cage has reported an exit status. With a timeout,
    /// `None` means it is still running.
    pub fn wait_exit(&self, timeout: Option<Duration>) -> Option<i32> {
        let life = self.life.lock().unwrap();
        match timeout {
            None => {
                let life = self
                    .exit_cond
                    .wait_while(life, |l| l.exit_status.is_none())
                    .unwrap();
                life.exit_status
            }
            Some(timeout) => {
                let (life, _result) = self
                    .exit_cond
                    .wait_timeout_while(life, timeout, |l| l.exit_status.is_none())
                    .unwrap();
                life.exit_status
            }
        }
    }

    // ---- VM hole and IO guard ----

    /// Announce that user copies into `[start, end]` are about to begin.
    /// Blocks while an address-space hole is open.
    pub fn io_will_start(&self, start: usize, end: usize) {
        let vm = self.vm.lock().unwrap();
        let mut vm = self.vm_cond.wait_while(vm, |vm| vm.hole_open).unwrap();
        vm.io_pending.push((start, end));
    }

    pub fn io_has_ended(&self, start: usize, end: usize) {
        let mut vm = self.vm.lock().unwrap();
        let at = vm
            .io_pending
            .iter()
            .position(|&r| r == (start, end))
            .expect("unbalanced io guard");
        vm.io_pending.remove(at);
        self.vm_cond.notify_all();
    }

    /// Open the address-space hole for a mapping change over
    /// `[start, end]`. Blocks while any overlapping user copy is in
    /// flight. The caller must already hold the vm guard it passes in.
    pub fn vm_hole_open<'a>(
        &'a self,
        mut vm: MutexGuard<'a, VmState>,
        start: usize,
        end: usize,
    ) -> MutexGuard<'a, VmState> {
        loop {
            let overlaps = vm
                .io_pending
                .iter()
                .any(|&(io_start, io_end)| io_start <= end && start <= io_end);
            if !overlaps {
                break;
            }
            vm = self.vm_cond.wait(vm).unwrap();
        }
        vm.hole_open = true;
        vm
    }

    pub fn vm_hole_close(&self, vm: &mut VmState) {
        vm.hole_open = false;
        self.vm_cond.notify_all();
    }

    /// Block until no address-space hole is open. thread_create uses this
    /// so a new stack never lands in a transient gap.
    pub fn wait_no_vm_hole(&self) {
        let vm = self.vm.lock().unwrap();
        let _vm = self.vm_cond.wait_while(vm, |vm| vm.hole_open).unwrap();
    }

    /// Scoped IO guard over `[start, start + len - 1]`; released on every
    /// exit path by drop.
    pub fn io_guard(&self, start: usize, len: usize) -> IoGuard<'_> {
        let end = start + len.saturating_sub(1);
        self.io_will_start(start, end);
        IoGuard {
            cage: self,
            start,
            end,
        }
    }
}

/// Keeps a user buffer range pinned against munmap for the duration of a
/// copy.
pub struct IoGuard<'a> {
    cage: &'a Cage,
    start: usize,
    end: usize,
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.cage.io_has_ended(self.start, self.end);
    }
}

impl std::fmt::Debug for Cage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cage({})", self.id)
    }
}

fn host_io_handle(file: HostIoFile) -> FileHandle {
    FileHandle::HostIo(Arc::new(atomic_refcell::AtomicRefCell::new(file)))
}

/// Lay out the initial mappings of a cage window: a data segment at the
/// bottom (above the unmapped first allocation page) and a stack at the
/// top. Returns the data segment range.
pub fn layout_initial_mappings(cage: &Cage, data_size: usize) -> Result<Range<usize>, Errno> {
    use crate::host::memory::{round_alloc_page, Prot, ALLOC_PAGE_SIZE};

    let data_start = ALLOC_PAGE_SIZE;
    let data_size = round_alloc_page(data_size);
    let stack_size = round_alloc_page(cage.stack_size());
    let window = cage.mem().size();
    assert!(data_start + data_size + stack_size < window);
    let stack_start = window - stack_size;

    cage.mem()
        .commit(data_start, data_size, Prot::READ | Prot::WRITE)?;
    cage.mem()
        .commit(stack_start, stack_size, Prot::READ | Prot::WRITE)?;

    let mut vm = cage.vm();
    vm.map.add_with_overwrite(
        data_start >> PAGE_SHIFT,
        data_size >> PAGE_SHIFT,
        Prot::READ | Prot::WRITE,
        None,
    );
    vm.map.add_with_overwrite(
        stack_start >> PAGE_SHIFT,
        stack_size >> PAGE_SHIFT,
        Prot::READ | Prot::WRITE,
        None,
    );
    vm.data_end = data_start + data_size;
    vm.break_addr = data_start + data_size;
    Ok(data_start..data_start + data_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cage() -> Cage {
        Cage::new(CageId::new(1), None, 24, 128 * 1024, false).unwrap()
    }

    #[test]
    fn test_std_descriptors_installed() {
        let c = cage();
        let table = c.descriptors();
        for fd in 0..3 {
            assert!(table.get(fd).is_some(), "fd {} missing", fd);
        }
        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_thread_numbering() {
        let c = cage();
        let t0 = c.add_thread(|num| Arc::new(CageThread::new(c.id(), num, 0)));
        let t1 = c.add_thread(|num| Arc::new(CageThread::new(c.id(), num, 1)));
        assert_eq!(t0.thread_num(), 0);
        assert_eq!(t1.thread_num(), 1);
        assert!(!c.remove_thread(0));
        let t2 = c.add_thread(|num| Arc::new(CageThread::new(c.id(), num, 2)));
        assert_eq!(t2.thread_num(), 0);
        assert!(!c.remove_thread(0));
        assert!(c.remove_thread(1));
    }

    #[test]
    fn test_children_accounting() {
        let c = cage();
        c.add_child(CageId::new(7));
        c.add_child(CageId::new(9));
        assert_eq!(c.num_children(), 2);
        assert!(c.remove_child(CageId::new(7)));
        assert!(!c.remove_child(CageId::new(7)));
        assert_eq!(c.children(), vec![CageId::new(9)]);
    }

    #[test]
    fn test_exit_status_first_report_wins() {
        let c = cage();
        c.report_exit(3);
        c.report_exit(5);
        assert_eq!(c.exit_status(), Some(3));
        assert_eq!(c.wait_exit(None), Some(3));
    }

    #[test]
    fn test_wait_exit_timeout() {
        let c = cage();
        assert_eq!(c.wait_exit(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn test_initial_layout() {
        use crate::host::memory::ALLOC_PAGE_SIZE;
        let c = cage();
        let data = layout_initial_mappings(&c, 2 * ALLOC_PAGE_SIZE).unwrap();
        assert_eq!(data.start, ALLOC_PAGE_SIZE);
        let vm = c.vm();
        assert_eq!(vm.break_addr, data.end);
        assert_eq!(vm.data_end, data.end);
        assert_eq!(vm.map.len(), 2);
        // the window base page stays unmapped
        assert!(vm.map.find_page(0).is_none());
    }

    #[test]
    fn test_io_guard_blocks_hole() {
        let c = Arc::new(cage());
        c.io_will_start(0x1000, 0x1fff);
        let c2 = Arc::clone(&c);
        let holder = std::thread::spawn(move || {
            let vm = c2.vm();
            // blocks until the io guard is dropped
            let mut vm = c2.vm_hole_open(vm, 0x1800, 0x2fff);
            c2.vm_hole_close(&mut vm);
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!holder.is_finished());
        c.io_has_ended(0x1000, 0x1fff);
        holder.join().unwrap();
    }
}
