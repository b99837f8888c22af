use super::{Runtime, RuntimeHandle};
use crate::error::{Error, Result};
use crate::operator::{OperatorHandler, SetupContext, StopReport};
use crate::OriginId;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use slicer_types::{EngineConfig, TerminationType};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Input buffers queued per worker before `push` blocks.
const QUEUE_DEPTH: usize = 16;

/// How often an idle worker checks for a kill signal.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs an [`OperatorHandler`] on a [`Runtime`].
///
/// Input is fed through one MPMC channel shared by all workers, so every
/// buffer is processed by exactly one worker, in no particular order.
pub struct Pipeline;

impl Pipeline {
    /// Sets up and starts `handler`, then spawns `config.workers` workers
    /// feeding it.
    pub fn start<H>(
        config: &EngineConfig,
        origins: impl IntoIterator<Item = OriginId>,
        handler: Arc<H>,
    ) -> Result<PipelineHandle<H>>
    where
        H: OperatorHandler,
    {
        config.validate()?;
        let num_workers = config.workers;
        handler.setup(&SetupContext::new(num_workers, origins))?;
        handler.start()?;

        let (sender, receiver) = bounded::<H::Input>(num_workers * QUEUE_DEPTH);
        let worker_handler = handler.clone();
        let runtime = Runtime::run(num_workers, move |ctx| {
            debug!("worker {} started", ctx.worker_id);
            loop {
                if Runtime::kill_in_progress() {
                    debug!("worker {} killed", ctx.worker_id);
                    return;
                }
                match receiver.recv_timeout(POLL_INTERVAL) {
                    Ok(input) => {
                        if let Err(error) = worker_handler.on_buffer(&ctx, input) {
                            worker_handler.report_failure(error);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("worker {} drained its input", ctx.worker_id);
                        return;
                    }
                }
            }
        })?;
        info!("pipeline started with {num_workers} workers");

        Ok(PipelineHandle {
            sender,
            runtime,
            handler,
        })
    }
}

/// Handle to a running [`Pipeline`].
pub struct PipelineHandle<H: OperatorHandler> {
    sender: Sender<H::Input>,
    runtime: RuntimeHandle,
    handler: Arc<H>,
}

impl<H: OperatorHandler> Debug for PipelineHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("queued", &self.sender.len())
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl<H: OperatorHandler> PipelineHandle<H> {
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Queues one input buffer, blocking while all workers are busy.
    pub fn push(&self, input: H::Input) -> Result<()> {
        if self.runtime.panicked() {
            return Err(Error::Terminated);
        }
        self.sender.send(input).map_err(|_| Error::Terminated)
    }

    /// Stops the pipeline.
    ///
    /// A graceful finish lets the workers process every queued buffer
    /// first; other termination types make them exit after the buffer they
    /// are working on.  If a worker panicked, the operator is stopped with
    /// [`TerminationType::Failure`] and the panics are returned as
    /// [`Error::WorkerPanic`].
    pub fn finish(self, termination: TerminationType) -> Result<StopReport> {
        let Self {
            sender,
            runtime,
            handler,
        } = self;
        drop(sender);
        if !termination.flushes() {
            runtime.kill_async();
        }

        let workers = runtime.runtime().clone();
        let joined = runtime.join();
        if joined.is_err() || workers.panicked() {
            let panic_info = workers.collect_panic_info();
            error!("{} worker threads panicked", panic_info.len());
            if let Err(error) = handler.stop(TerminationType::Failure) {
                error!("failed to stop operator after worker panic: {error}");
            }
            return Err(Error::WorkerPanic { panic_info });
        }

        handler.stop(termination)
    }
}
