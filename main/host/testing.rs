//! In-memory module collaborators for exercising the broker from tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::configuration::RuntimeOptions;
use crate::host::cage::{layout_initial_mappings, Cage};
use crate::host::context::ThreadContext;
use crate::host::memory::ALLOC_PAGE_SIZE;
use crate::host::module::{
    AcceptAllValidator, ModuleImage, ModuleLoader, ThreadEntry,
};
use crate::host::runtime::Runtime;
use crate::host::thread::{CageThread, UserContext};

pub(crate) type MainBody = dyn Fn(&ThreadContext, Vec<String>) -> i32 + Send + Sync;
pub(crate) type ForkBody = dyn Fn(&ThreadContext, UserContext) -> i32 + Send + Sync;

/// A module whose entry points are Rust closures.
pub(crate) struct TestModule {
    data_size: usize,
    main: Arc<MainBody>,
    forked: Option<Arc<ForkBody>>,
    thread: Option<Arc<ForkBody>>,
}

impl TestModule {
    pub fn new(main: impl Fn(&ThreadContext, Vec<String>) -> i32 + Send + Sync + 'static) -> Self {
        Self {
            data_size: 4 * ALLOC_PAGE_SIZE,
            main: Arc::new(main),
            forked: None,
            thread: None,
        }
    }

    pub fn with_forked(
        mut self,
        forked: impl Fn(&ThreadContext, UserContext) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.forked = Some(Arc::new(forked));
        self
    }

    pub fn with_thread(
        mut self,
        thread: impl Fn(&ThreadContext, UserContext) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.thread = Some(Arc::new(thread));
        self
    }
}

impl ModuleImage for TestModule {
    fn prepare(&self, cage: &Cage) -> anyhow::Result<()> {
        layout_initial_mappings(cage, self.data_size)?;
        Ok(())
    }

    fn main_entry(&self, argv: Vec<String>) -> ThreadEntry {
        let main = Arc::clone(&self.main);
        Box::new(move |ctx| main(ctx, argv))
    }

    fn forked_entry(&self, user_ctx: UserContext) -> ThreadEntry {
        let forked = self.forked.clone().expect("test module has no fork body");
        Box::new(move |ctx| forked(ctx, user_ctx))
    }

    fn thread_entry(&self, user_ctx: UserContext) -> ThreadEntry {
        let thread = self.thread.clone().expect("test module has no thread body");
        Box::new(move |ctx| thread(ctx, user_ctx))
    }
}

/// Loader serving pre-registered images by path.
#[derive(Default)]
pub(crate) struct TestLoader {
    images: Mutex<HashMap<PathBuf, Arc<TestModule>>>,
}

impl TestLoader {
    pub fn insert(&self, path: impl Into<PathBuf>, image: TestModule) {
        self.images
            .lock()
            .unwrap()
            .insert(path.into(), Arc::new(image));
    }
}

impl ModuleLoader for TestLoader {
    fn load(&self, _cage: &Cage, path: &Path) -> anyhow::Result<Arc<dyn ModuleImage>> {
        let images = self.images.lock().unwrap();
        let image = images
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("no module at {:?}", path))?;
        Ok(Arc::clone(image) as Arc<dyn ModuleImage>)
    }
}

pub(crate) fn test_options() -> RuntimeOptions {
    RuntimeOptions {
        addr_bits: 24,
        stack_size: 128 * 1024,
        ..RuntimeOptions::default()
    }
}

pub(crate) fn test_runtime(options: RuntimeOptions, loader: Arc<TestLoader>) -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::builder(options)
        .loader(loader)
        .validator(Arc::new(AcceptAllValidator))
        .build()
        .unwrap()
}

/// A registered cage plus a thread to issue syscalls from, without a host
/// thread behind it. For handler tests that drive the broker directly.
pub(crate) struct Caller {
    pub runtime: Arc<Runtime>,
    pub cage: Arc<Cage>,
    pub thread: Arc<CageThread>,
}

impl Caller {
    pub fn new(options: RuntimeOptions) -> Self {
        Self::with_runtime(test_runtime(options, Arc::new(TestLoader::default())))
    }

    pub fn with_runtime(runtime: Arc<Runtime>) -> Self {
        let cage = runtime.create_cage(None).unwrap();
        layout_initial_mappings(&cage, 4 * ALLOC_PAGE_SIZE).unwrap();
        runtime.register_cage(&cage, None);
        cage.set_running();
        let id = cage.id();
        let thread = cage.add_thread(|num| Arc::new(CageThread::new(id, num, 0)));
        Self {
            runtime,
            cage,
            thread,
        }
    }

    pub fn ctx(&self) -> ThreadContext<'_> {
        ThreadContext::new(&self.runtime, &self.cage, &self.thread)
    }

    /// A user address inside the cage's data segment.
    pub fn data_addr(&self, offset: usize) -> usize {
        ALLOC_PAGE_SIZE + offset
    }
}
