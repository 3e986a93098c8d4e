//! Interfaces to the collaborators that produce and duplicate untrusted
//! code: the module loader, the code validator, the execution-context
//! copier used by fork, and the debug stub.
//!
//! The runtime never interprets module bytes itself; everything behind
//! these traits is supplied by the embedder. The crate ships minimal
//! implementations sufficient for exercising the broker.

use std::path::Path;
use std::sync::Arc;

use log::*;
use nix::errno::Errno;

use crate::host::cage::Cage;
use crate::host::context::ThreadContext;
use crate::host::memory::{Prot, PAGE_SHIFT};
use crate::host::thread::UserContext;

/// The body a cage thread runs once it has switched to untrusted execution.
pub type ThreadEntry = Box<dyn FnOnce(&ThreadContext) -> i32 + Send>;

/// A loaded module: the image that supplies entry points for a cage's
/// threads.
pub trait ModuleImage: Send + Sync {
    /// Install the image into the cage window: data segment, stack, and
    /// any initial text. Runs before the main thread starts.
    fn prepare(&self, cage: &Cage) -> anyhow::Result<()>;

    /// Entry for the cage's main thread.
    fn main_entry(&self, argv: Vec<String>) -> ThreadEntry;

    /// Continuation for the child thread produced by fork. The context is
    /// the parent's captured user context with the return registers
    /// already rewritten for the child.
    fn forked_entry(&self, user_ctx: UserContext) -> ThreadEntry {
        let _ = user_ctx;
        Box::new(|_| {
            warn!("module image has no fork continuation");
            -1
        })
    }

    /// Entry for a thread started via thread_create.
    fn thread_entry(&self, user_ctx: UserContext) -> ThreadEntry {
        let _ = user_ctx;
        Box::new(|_| {
            warn!("module image has no thread entry");
            -1
        })
    }
}

/// Loads module images by path.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, cage: &Cage, path: &Path) -> anyhow::Result<Arc<dyn ModuleImage>>;
}

/// Policy inputs for one validation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationPolicy {
    pub stubout_mode: bool,
    pub readonly_text: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ValidationStatus {
    Ok,
    Failed,
}

/// The code validator gating every executable mapping.
pub trait Validator: Send + Sync {
    fn validate(&self, bytes: &[u8], policy: &ValidationPolicy) -> ValidationStatus;
}

/// Refuses everything; the safe default when no validator is supplied.
pub struct RejectAllValidator;

impl Validator for RejectAllValidator {
    fn validate(&self, _bytes: &[u8], _policy: &ValidationPolicy) -> ValidationStatus {
        ValidationStatus::Failed
    }
}

/// Accepts everything. Test use only.
pub struct AcceptAllValidator;

impl Validator for AcceptAllValidator {
    fn validate(&self, _bytes: &[u8], _policy: &ValidationPolicy) -> ValidationStatus {
        ValidationStatus::Ok
    }
}

/// Hooks the debug stub wants around thread lifetime. Callbacks run
/// without any cage-scoped lock held.
pub trait DebugStub: Send + Sync {
    fn thread_create_hook(&self, cage_id: u32, thread_num: usize) {
        let _ = (cage_id, thread_num);
    }

    fn thread_exit_hook(&self, cage_id: u32, thread_num: usize) {
        let _ = (cage_id, thread_num);
    }

    /// Called before a user exception handler is installed.
    fn ensure_exception_handler_attached(&self, cage_id: u32) -> Result<(), Errno> {
        let _ = cage_id;
        Ok(())
    }
}

/// The default stub: observes nothing.
pub struct NullDebugStub;

impl DebugStub for NullDebugStub {}

/// An opaque copy of one cage's execution state, produced by
/// [`ExecutionCopier::snapshot`].
pub struct ExecutionSnapshot {
    regions: Vec<SnapshotRegion>,
    break_addr: usize,
    data_end: usize,
    dynamic_text: std::ops::Range<usize>,
}

struct SnapshotRegion {
    page_num: usize,
    npages: usize,
    prot: Prot,
    bytes: Option<Vec<u8>>,
}

/// Duplicates a parent cage's execution context into a child. fork's
/// memory semantics live here; the broker only links cages and publishes
/// the new thread.
pub trait ExecutionCopier: Send + Sync {
    fn snapshot(&self, parent: &Cage) -> Result<ExecutionSnapshot, Errno>;
    fn install(&self, child: &Cage, snapshot: &ExecutionSnapshot) -> Result<(), Errno>;
}

/// Copies the parent's committed window bytes region by region.
pub struct MemcpyExecutionCopier;

impl ExecutionCopier for MemcpyExecutionCopier {
    fn snapshot(&self, parent: &Cage) -> Result<ExecutionSnapshot, Errno> {
        let vm = parent.vm();
        let mut regions = Vec::with_capacity(vm.map.len());
        for ent in vm.map.iter() {
            let bytes = if ent.prot.contains(Prot::READ) {
                let mut buf = vec![0u8; ent.npages << PAGE_SHIFT];
                parent
                    .mem()
                    .copy_from_user(&mut buf, ent.start_addr().into())?;
                Some(buf)
            } else {
                None
            };
            regions.push(SnapshotRegion {
                page_num: ent.page_num,
                npages: ent.npages,
                prot: ent.prot,
                bytes,
            });
        }
        trace!(
            "snapshot of cage {} captured {} regions",
            parent.id(),
            regions.len()
        );
        Ok(ExecutionSnapshot {
            regions,
            break_addr: vm.break_addr,
            data_end: vm.data_end,
            dynamic_text: parent.dynamic_text(),
        })
    }

    fn install(&self, child: &Cage, snapshot: &ExecutionSnapshot) -> Result<(), Errno> {
        let mut vm = child.vm();
        for region in &snapshot.regions {
            let start = region.page_num << PAGE_SHIFT;
            let len = region.npages << PAGE_SHIFT;
            // commit writable to land the bytes, then drop to the real
            // protection
            child.mem().commit(start, len, Prot::READ | Prot::WRITE)?;
            if let Some(bytes) = &region.bytes {
                child.mem().copy_to_user(start.into(), bytes)?;
            }
            if region.prot != (Prot::READ | Prot::WRITE) {
                child.mem().protect(start, len, region.prot)?;
            }
            vm.map
                .add_with_overwrite(region.page_num, region.npages, region.prot, None);
        }
        vm.break_addr = snapshot.break_addr;
        vm.data_end = snapshot.data_end;
        drop(vm);
        child.set_dynamic_text(snapshot.dynamic_text.clone());
        Ok(())
    }
}
