//! The runtime: the one value owning every process-wide table.
//!
//! All shared state lives here: the cage registry, the global thread
//! table, the pipe set, and the collaborator handles. Entry points take the
//! runtime by reference; there are no hidden globals.
//!
//! Lock order, coarse to fine: runtime live/registry locks, a cage's
//! children lock, its life lock, its threads lock, the per-thread locks,
//! the descriptor-table lock, the VM lock. The debug stub's own lock sits
//! above all of these, so its hooks run with none of them held.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use anyhow::Context as _;
use log::*;
use nix::errno::Errno;

use crate::core::configuration::RuntimeOptions;
use crate::host::cage::{Cage, CageId, RunState};
use crate::host::context::ThreadContext;
use crate::host::descriptor::table::FdEntry;
use crate::host::module::{
    DebugStub, ExecutionCopier, MemcpyExecutionCopier, ModuleLoader, NullDebugStub,
    RejectAllValidator, ThreadEntry, Validator,
};
use crate::host::pipe::PipeSet;
use crate::host::syscall::handler::{register_all, SyscallHandler};
use crate::host::syscall::table::SyscallTable;
use crate::host::syscall::types::{to_raw_return, SyscallArgs};
use crate::host::thread::{CageThread, SuspendState, UserContext};

/// Capacity of the global thread table; thread creation fails once every
/// slot is taken.
const MAX_THREADS: usize = 1024;

/// Builds a [`Runtime`] with explicit collaborators.
pub struct RuntimeBuilder {
    options: RuntimeOptions,
    loader: Option<Arc<dyn ModuleLoader>>,
    validator: Arc<dyn Validator>,
    debug_stub: Arc<dyn DebugStub>,
    copier: Arc<dyn ExecutionCopier>,
}

impl RuntimeBuilder {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            options,
            loader: None,
            validator: Arc::new(RejectAllValidator),
            debug_stub: Arc::new(NullDebugStub),
            copier: Arc::new(MemcpyExecutionCopier),
        }
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn debug_stub(mut self, debug_stub: Arc<dyn DebugStub>) -> Self {
        self.debug_stub = debug_stub;
        self
    }

    pub fn execution_copier(mut self, copier: Arc<dyn ExecutionCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<Runtime>> {
        let loader = self.loader.context("a module loader is required")?;
        let mut syscalls = SyscallTable::new();
        register_all(&mut syscalls);
        // launched host threads need their own handle on the runtime, so
        // it carries a weak reference to itself from birth
        Ok(Arc::new_cyclic(|self_ref| Runtime {
            self_ref: self_ref.clone(),
            pipes: PipeSet::new(self.options.pipe_slots, self.options.pipe_capacity),
            options: self.options,
            loader,
            validator: self.validator,
            debug_stub: self.debug_stub,
            copier: self.copier,
            syscalls,
            handler: SyscallHandler::new(),
            cages: RwLock::new(BTreeMap::new()),
            next_cage_id: Mutex::new(1),
            fork_counter: Mutex::new(0),
            thread_table: Mutex::new(Vec::new()),
            join_handles: Mutex::new(Vec::new()),
            live: Mutex::new(0),
            master_cond: Condvar::new(),
        }))
    }
}

pub struct Runtime {
    self_ref: Weak<Runtime>,
    options: RuntimeOptions,
    pipes: PipeSet,
    loader: Arc<dyn ModuleLoader>,
    validator: Arc<dyn Validator>,
    debug_stub: Arc<dyn DebugStub>,
    copier: Arc<dyn ExecutionCopier>,
    syscalls: SyscallTable,
    handler: SyscallHandler,

    cages: RwLock<BTreeMap<CageId, Arc<Cage>>>,
    next_cage_id: Mutex<u32>,
    fork_counter: Mutex<u32>,

    // reverse lookup from a thread's tls index to the thread
    thread_table: Mutex<Vec<Option<Weak<CageThread>>>>,

    join_handles: Mutex<Vec<JoinHandle<()>>>,

    // cages created and not yet fully torn down
    live: Mutex<usize>,
    master_cond: Condvar,
}

impl Runtime {
    pub fn builder(options: RuntimeOptions) -> RuntimeBuilder {
        RuntimeBuilder::new(options)
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn pipes(&self) -> &PipeSet {
        &self.pipes
    }

    pub fn validator(&self) -> &dyn Validator {
        &*self.validator
    }

    pub fn debug_stub(&self) -> &dyn DebugStub {
        &*self.debug_stub
    }

    pub fn execution_copier(&self) -> &dyn ExecutionCopier {
        &*self.copier
    }

    pub fn cage(&self, id: CageId) -> Option<Arc<Cage>> {
        self.cages.read().unwrap().get(&id).cloned()
    }

    pub fn cage_ids(&self) -> Vec<CageId> {
        self.cages.read().unwrap().keys().copied().collect()
    }

    /// The number of cages created so far by fork.
    pub fn fork_count(&self) -> u32 {
        *self.fork_counter.lock().unwrap()
    }

    pub(crate) fn bump_fork_counter(&self) -> u32 {
        let mut counter = self.fork_counter.lock().unwrap();
        *counter += 1;
        *counter
    }

    fn next_cage_id(&self) -> CageId {
        let mut next = self.next_cage_id.lock().unwrap();
        let id = CageId::new(*next);
        *next += 1;
        id
    }

    /// Allocate a cage object with a fresh id. Not yet visible in the
    /// registry.
    pub(crate) fn create_cage(&self, parent: Option<CageId>) -> anyhow::Result<Arc<Cage>> {
        let id = self.next_cage_id();
        let cage = Cage::new(
            id,
            parent,
            self.options.addr_bits,
            self.options.stack_size,
            self.options.enable_exception_handling,
        )?;
        Ok(Arc::new(cage))
    }

    /// Publish a cage: registry insert, parent linkage, and the children
    /// broadcast, in that order.
    pub(crate) fn register_cage(&self, cage: &Arc<Cage>, parent: Option<&Arc<Cage>>) {
        *self.live.lock().unwrap() += 1;
        self.cages
            .write()
            .unwrap()
            .insert(cage.id(), Arc::clone(cage));
        if let Some(parent) = parent {
            parent.add_child(cage.id());
        }
        debug!(
            "registered cage {} (parent: {:?})",
            cage.id(),
            parent.map(|p| p.id())
        );
    }

    /// Create a cage running the module at `path` as a child of nobody.
    /// This is cage creation from the outside: load, prepare, publish,
    /// launch.
    pub fn spawn_cage(&self, path: &Path, argv: Vec<String>) -> anyhow::Result<CageId> {
        let cage = self.create_cage(None)?;
        self.load_and_launch(&cage, None, path, argv)?;
        Ok(cage.id())
    }

    /// Shared spawn path for spawn_cage and exec replacement.
    pub(crate) fn load_and_launch(
        &self,
        cage: &Arc<Cage>,
        parent: Option<&Arc<Cage>>,
        path: &Path,
        argv: Vec<String>,
    ) -> anyhow::Result<()> {
        let module = self
            .loader
            .load(cage, path)
            .with_context(|| format!("loading module {:?}", path))?;
        module
            .prepare(cage)
            .with_context(|| format!("preparing module {:?}", path))?;
        cage.set_module(Arc::clone(&module));
        cage.set_binary_path(path.to_string_lossy().into_owned());
        self.register_cage(cage, parent);
        cage.set_running();
        let entry = module.main_entry(argv);
        self.launch_thread(cage, entry, None)
            .map_err(|e| anyhow::anyhow!("launching main thread: {}", e))?;
        Ok(())
    }

    // ---- the thread table ----

    // The tls index is chosen before the thread object exists, so the slot
    // is reserved with an empty weak and backfilled once the thread is
    // made.
    fn reserve_thread_slot(&self) -> Option<usize> {
        let mut table = self.thread_table.lock().unwrap();
        let idx = match table.iter().position(|slot| slot.is_none()) {
            Some(idx) => idx,
            None if table.len() < MAX_THREADS => {
                table.push(None);
                table.len() - 1
            }
            None => return None,
        };
        table[idx] = Some(Weak::new());
        Some(idx)
    }

    fn clear_thread_slot(&self, idx: usize) {
        let mut table = self.thread_table.lock().unwrap();
        assert!(table[idx].take().is_some(), "thread slot {} not in use", idx);
    }

    /// Reverse lookup from tls index to thread, for the exception path.
    pub fn thread_by_tls_index(&self, idx: usize) -> Option<Arc<CageThread>> {
        self.thread_table
            .lock()
            .unwrap()
            .get(idx)?
            .as_ref()?
            .upgrade()
    }

    // ---- thread lifecycle ----

    /// Make a thread and start its host thread. `init_ctx` seeds the user
    /// context (fork and thread_create); the main thread starts from a
    /// default context.
    pub(crate) fn launch_thread(
        &self,
        cage: &Arc<Cage>,
        entry: ThreadEntry,
        init_ctx: Option<UserContext>,
    ) -> Result<Arc<CageThread>, Errno> {
        // thread_make: reserve the tls slot first so failure leaves no
        // trace in the cage
        let Some(tls_index) = self.reserve_thread_slot() else {
            warn!("thread table exhausted");
            return Err(Errno::EAGAIN);
        };

        let thread = cage.add_thread(|num| Arc::new(CageThread::new(cage.id(), num, tls_index)));
        self.thread_table.lock().unwrap()[tls_index] = Some(Arc::downgrade(&thread));
        if let Some(ctx) = init_ctx {
            thread.set_user_ctx(ctx);
        }

        let runtime = self.self_ref.upgrade().expect("runtime already dropped");
        let launched_cage = Arc::clone(cage);
        let launched = Arc::clone(&thread);
        let name = format!("cage-{}-thread-{}", cage.id(), thread.thread_num());
        let spawned = std::thread::Builder::new()
            .name(name)
            .stack_size(2 * 1024 * 1024)
            .spawn(move || runtime.thread_launcher(launched_cage, launched, entry));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("host thread construction failed: {}", e);
                // roll back thread_make
                self.clear_thread_slot(tls_index);
                cage.remove_thread(thread.thread_num());
                return Err(Errno::EAGAIN);
            }
        };
        self.join_handles.lock().unwrap().push(handle);
        Ok(thread)
    }

    /// Runs on the new host thread: the trusted prologue, the switch to
    /// untrusted execution, and teardown when the body returns.
    fn thread_launcher(self: Arc<Self>, cage: Arc<Cage>, thread: Arc<CageThread>, entry: ThreadEntry) {
        thread.register_signal_stack();
        self.debug_stub
            .thread_create_hook(cage.id().into(), thread.thread_num());
        thread.set_suspend_state(SuspendState::Untrusted);

        let status = {
            let ctx = ThreadContext::new(&self, &cage, &thread);
            entry(&ctx)
        };

        thread.set_suspend_state(SuspendState::Trusted);
        self.thread_teardown(&cage, &thread, status);
    }

    /// The dying thread's epilogue. Runs with no lock held on entry;
    /// never returns control to module code.
    pub(crate) fn thread_teardown(&self, cage: &Arc<Cage>, thread: &Arc<CageThread>, status: i32) {
        let last = cage.thread_count() == 1;

        if last {
            // a cage that falls off the end of its entry exits with the
            // body's return value, unless an exit syscall already reported
            cage.report_exit(status);

            // wait for our own children to finish, and reap the stragglers
            for child_id in cage.children() {
                let Some(child) = self.cage(child_id) else {
                    cage.remove_child(child_id);
                    continue;
                };
                child.wait_exit(None);
                self.reap_child(cage, &child);
            }

            // release the descriptor table now rather than at reaping; an
            // exiting writer must not leave a pipe reader waiting
            let entries: Vec<_> = cage.descriptors().remove_all().collect();
            for entry in entries {
                if let FdEntry::Pipe { slot, end } = entry {
                    let _ = self.pipes.close_end(slot, end);
                }
            }
        }

        // the stub's lock sits above every cage lock, so notify before
        // touching the thread table
        self.debug_stub
            .thread_exit_hook(cage.id().into(), thread.thread_num());

        self.clear_thread_slot(thread.tls_index());
        let was_last = cage.remove_thread(thread.thread_num());
        thread.unregister_signal_stack();

        if was_last {
            // covers the race where two threads left together and neither
            // saw itself as last above; the first report still wins
            cage.report_exit(status);
            self.finish_cage(cage);
            // hold the host thread until no cages remain, so late peers can
            // still join through us
            self.master_wait();
        }
    }

    // The unique destroyer path: parent notification and, for orphan
    // cages, registry removal.
    fn finish_cage(&self, cage: &Arc<Cage>) {
        debug_assert_eq!(cage.run_state(), RunState::Exiting);
        match cage.parent_id().and_then(|id| self.cage(id)) {
            Some(parent) => {
                // stays in the registry as a zombie until reaped
                parent.children_cond.notify_all();
            }
            None => {
                self.cages.write().unwrap().remove(&cage.id());
            }
        }
        let mut live = self.live.lock().unwrap();
        *live -= 1;
        self.master_cond.notify_all();
        debug!("cage {} finished ({} still live)", cage.id(), *live);
    }

    fn master_wait(&self) {
        let live = self.live.lock().unwrap();
        let _live = self.master_cond.wait_while(live, |live| *live > 0).unwrap();
    }

    /// Remove an exited child from the registry and the parent's set.
    /// Idempotent; returns the exit status if this call did the reaping.
    pub(crate) fn reap_child(&self, parent: &Cage, child: &Arc<Cage>) -> Option<i32> {
        if !parent.remove_child(child.id()) {
            return None;
        }
        let status = child.exit_status();
        debug_assert!(status.is_some(), "reaping a running child");
        self.cages.write().unwrap().remove(&child.id());
        status
    }

    /// Block until every cage has finished, then join the host threads.
    pub fn wait_all(&self) {
        self.master_wait();
        let handles: Vec<_> = self.join_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.join() {
                error!("host thread panicked: {:?}", e);
            }
        }
    }

    // ---- the syscall boundary ----

    /// Service one syscall from the given caller. Returns the raw signed
    /// value for the untrusted return register.
    pub fn handle_syscall(&self, ctx: &ThreadContext, args: &SyscallArgs) -> i32 {
        ctx.thread.set_suspend_state(SuspendState::Trusted);
        trace!(
            "cage {} thread {} syscall {}",
            ctx.cage.id(),
            ctx.thread.thread_num(),
            args.number()
        );
        let mut ctx = ThreadContext::new(ctx.runtime, ctx.cage, ctx.thread);
        let result = self.syscalls.dispatch(&self.handler, &mut ctx, args);
        let raw = to_raw_return(result);
        ctx.thread
            .with_user_ctx(|user| user.sysret = raw as u32 as u64);
        ctx.thread.set_suspend_state(SuspendState::Untrusted);
        raw
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Runtime({} cages, {} live)",
            self.cages.read().unwrap().len(),
            self.live.lock().unwrap()
        )
    }
}
