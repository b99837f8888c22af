use crate::error::{Error, Resource, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A counting semaphore built on a bounded channel pre-filled with tokens.
///
/// `acquire` blocks while no token is available, which is how the engine
/// applies backpressure when output buffers or join pages run out.
#[derive(Clone)]
pub struct PermitPool {
    inner: Arc<PermitPoolInner>,
}

struct PermitPoolInner {
    resource: Resource,
    capacity: usize,
    tokens: Sender<()>,
    available: Receiver<()>,
}

impl Debug for PermitPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermitPool")
            .field("resource", &self.inner.resource)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl PermitPool {
    pub fn new(resource: Resource, capacity: usize) -> Self {
        let (tokens, available) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel has exactly `capacity` slots.
            let _ = tokens.try_send(());
        }
        Self {
            inner: Arc::new(PermitPoolInner {
                resource,
                capacity,
                tokens,
                available,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of permits that can be acquired without blocking.
    pub fn available(&self) -> usize {
        self.inner.available.len()
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        self.inner.available.try_recv().ok().map(|()| Permit {
            pool: self.inner.clone(),
        })
    }

    /// Takes a permit, blocking until one is returned.  With a `timeout`,
    /// gives up with [`Error::ResourceExhausted`] once it elapses.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<Permit> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }

        debug!("{} exhausted, waiting for a permit", self.inner.resource);
        let started = Instant::now();
        let received = match timeout {
            None => self.inner.available.recv().map_err(|_| Error::Terminated),
            Some(timeout) => {
                self.inner
                    .available
                    .recv_timeout(timeout)
                    .map_err(|error| match error {
                        RecvTimeoutError::Timeout => {
                            warn!(
                                "{} still exhausted after {timeout:?}",
                                self.inner.resource
                            );
                            metrics::counter!("slicer.resource_exhausted").increment(1);
                            Error::ResourceExhausted {
                                resource: self.inner.resource,
                                waited: started.elapsed(),
                            }
                        }
                        RecvTimeoutError::Disconnected => Error::Terminated,
                    })
            }
        };
        received.map(|()| Permit {
            pool: self.inner.clone(),
        })
    }
}

/// A token taken from a [`PermitPool`].  Returned to the pool on drop.
pub struct Permit {
    pool: Arc<PermitPoolInner>,
}

impl Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permit({})", self.pool.resource)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.pool.tokens.try_send(());
    }
}
