//! A multithreaded runtime that hosts window operators on a fixed pool of
//! named worker threads.

mod pipeline;

pub use pipeline::{Pipeline, PipelineHandle};

use crate::error::{Error, Result};
use crate::operator::WorkerContext;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::{
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    fmt::{self, Debug, Display, Formatter},
    io,
    panic::{self, Location, PanicHookInfo},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    thread::{Builder, JoinHandle, Result as ThreadResult},
};
use tracing::{debug, error, warn};

thread_local! {
    // Set on worker threads only.
    static RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };

    static WORKER_INDEX: Cell<usize> = const { Cell::new(0) };
}

/// Source location of a worker panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanicLocation {
    file: String,
    line: u32,
    col: u32,
}

impl Display for PanicLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

impl PanicLocation {
    fn new(loc: &Location) -> Self {
        Self {
            file: loc.file().to_string(),
            line: loc.line(),
            col: loc.column(),
        }
    }
}

/// What the panic hook captured about a failed worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPanicInfo {
    message: Option<String>,
    location: Option<PanicLocation>,
    backtrace: String,
}

impl Display for WorkerPanicInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => writeln!(f, "worker panicked: {message}")?,
            None => writeln!(f, "worker panicked without a message")?,
        }
        match &self.location {
            Some(location) => writeln!(f, "at {location}")?,
            None => writeln!(f, "at an unknown location")?,
        }
        writeln!(f, "backtrace:\n{}", self.backtrace)
    }
}

impl WorkerPanicInfo {
    fn new(info: &PanicHookInfo) -> Self {
        let payload = info.payload();
        Self {
            message: payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|message| message.to_string())),
            location: info.location().map(PanicLocation::new),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub fn location(&self) -> Option<&PanicLocation> {
        self.location.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

struct RuntimeInner {
    num_workers: usize,
    kill_signal: AtomicBool,
    /// One slot per worker, filled by the panic hook.
    panic_info: Vec<RwLock<Option<WorkerPanicInfo>>>,
    panicked: AtomicBool,
}

impl Debug for RuntimeInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("num_workers", &self.num_workers)
            .field("kill_signal", &self.kill_signal)
            .field("panicked", &self.panicked)
            .finish()
    }
}

impl RuntimeInner {
    fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            kill_signal: AtomicBool::new(false),
            panic_info: (0..num_workers).map(|_| RwLock::new(None)).collect(),
            panicked: AtomicBool::new(false),
        }
    }
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

// The process-wide hook chains to the standard one and records panics of
// threads that belong to a runtime.  Other threads are left alone.
fn panic_hook(info: &PanicHookInfo<'_>, default_hook: &dyn Fn(&PanicHookInfo<'_>)) {
    default_hook(info);
    RUNTIME.with(|runtime| {
        if let Some(runtime) = runtime.try_borrow().ok().as_deref().and_then(Option::as_ref) {
            runtime.record_panic(info);
        }
    })
}

/// Worker threads running the same closure.
#[repr(transparent)]
#[derive(Clone, Debug)]
pub struct Runtime(Arc<RuntimeInner>);

static DEFAULT_PANIC_HOOK: Lazy<PanicHook> = Lazy::new(|| {
    // Drop whatever hook was installed before, keeping the standard one.
    let _ = panic::take_hook();
    panic::take_hook()
});

impl Runtime {
    /// Creates a runtime with `num_workers` worker threads and runs
    /// `worker` in each of them.  Every thread receives its
    /// [`WorkerContext`].
    ///
    /// ```
    /// use slicer::Runtime;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::sync::Arc;
    ///
    /// let sum = Arc::new(AtomicUsize::new(0));
    /// let worker_sum = sum.clone();
    /// let handle = Runtime::run(4, move |ctx| {
    ///     worker_sum.fetch_add(ctx.worker_id, Ordering::SeqCst);
    /// })
    /// .unwrap();
    /// handle.join().unwrap();
    /// assert_eq!(sum.load(Ordering::SeqCst), 0 + 1 + 2 + 3);
    /// ```
    pub fn run<F>(num_workers: usize, worker: F) -> Result<RuntimeHandle>
    where
        F: FnOnce(WorkerContext) + Clone + Send + 'static,
    {
        Self::run_with_spawner(num_workers, worker, |builder, body| builder.spawn(body))
    }

    fn run_with_spawner<F, S>(num_workers: usize, worker: F, mut spawn: S) -> Result<RuntimeHandle>
    where
        F: FnOnce(WorkerContext) + Clone + Send + 'static,
        S: FnMut(Builder, WorkerBody) -> io::Result<JoinHandle<()>>,
    {
        let runtime = Self(Arc::new(RuntimeInner::new(num_workers)));

        let default_hook: &'static PanicHook = &DEFAULT_PANIC_HOOK;
        panic::set_hook(Box::new(move |info| panic_hook(info, default_hook)));

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let worker_runtime = runtime.clone();
            let worker = worker.clone();
            let builder = Builder::new().name(format!("slicer-worker-{worker_id}"));
            let body: WorkerBody = Box::new(move || {
                WORKER_INDEX.set(worker_id);
                RUNTIME.with(|slot| *slot.borrow_mut() = Some(worker_runtime));
                worker(WorkerContext::new(worker_id, num_workers));
            });
            match spawn(builder, body) {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    error!("failed to spawn worker thread {worker_id}: {error}");
                    // Threads that did start must not outlive the failed run.
                    let started = RuntimeHandle::new(runtime, workers);
                    if started.kill().is_err() {
                        warn!("a worker panicked while the runtime was shutting down");
                    }
                    return Err(Error::WorkerSpawn {
                        worker: worker_id,
                        reason: error.to_string(),
                    });
                }
            }
        }
        debug!("started {num_workers} worker threads");

        Ok(RuntimeHandle::new(runtime, workers))
    }

    /// The runtime of the calling worker thread, if any.
    #[allow(clippy::self_named_constructors)]
    pub fn runtime() -> Option<Runtime> {
        RUNTIME.with(|slot| slot.borrow().clone())
    }

    /// Index of the calling worker thread, or 0 outside a runtime.
    pub fn worker_index() -> usize {
        WORKER_INDEX.get()
    }

    fn inner(&self) -> &RuntimeInner {
        &self.0
    }

    pub fn num_workers(&self) -> usize {
        self.inner().num_workers
    }

    /// Returns `true` once the calling worker's runtime is being killed.
    /// Workers check this between two buffers.
    pub fn kill_in_progress() -> bool {
        RUNTIME.with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|runtime| runtime.inner().kill_signal.load(Ordering::SeqCst))
        })
    }

    pub fn worker_panic_info(&self, worker: usize) -> Option<WorkerPanicInfo> {
        match self.inner().panic_info.get(worker)?.read() {
            Ok(slot) => slot.clone(),
            Err(_) => {
                warn!("panic info of worker {worker} is poisoned");
                None
            }
        }
    }

    /// `(worker, panic)` for every worker that panicked.
    pub fn collect_panic_info(&self) -> Vec<(usize, WorkerPanicInfo)> {
        (0..self.num_workers())
            .filter_map(|worker| Some((worker, self.worker_panic_info(worker)?)))
            .collect()
    }

    pub fn panicked(&self) -> bool {
        self.inner().panicked.load(Ordering::Acquire)
    }

    fn record_panic(&self, info: &PanicHookInfo) {
        let worker = Self::worker_index();
        if let Some(slot) = self.inner().panic_info.get(worker) {
            if let Ok(mut slot) = slot.write() {
                *slot = Some(WorkerPanicInfo::new(info));
            }
        }
        self.inner().panicked.store(true, Ordering::Release);
    }
}

/// Owner of the worker threads started by [`Runtime::run`].
#[derive(Debug)]
pub struct RuntimeHandle {
    runtime: Runtime,
    workers: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    fn new(runtime: Runtime, workers: Vec<JoinHandle<()>>) -> Self {
        Self { runtime, workers }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Signals the workers to exit and waits for them.
    pub fn kill(self) -> ThreadResult<()> {
        self.kill_async();
        self.join()
    }

    /// Signals the workers to exit without waiting for them.
    pub fn kill_async(&self) {
        self.runtime
            .inner()
            .kill_signal
            .store(true, Ordering::SeqCst);
    }

    /// Waits for every worker, including the ones after a failed one.
    /// Fails if any worker panicked.
    pub fn join(self) -> ThreadResult<()> {
        let mut result = Ok(());
        for worker in self.workers {
            if let Err(panic) = worker.join() {
                result = Err(panic);
            }
        }
        result
    }

    pub fn collect_panic_info(&self) -> Vec<(usize, WorkerPanicInfo)> {
        self.runtime.collect_panic_info()
    }

    pub fn panicked(&self) -> bool {
        self.runtime.panicked()
    }
}
