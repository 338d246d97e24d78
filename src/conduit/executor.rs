//! Executors for delegated handshake tasks

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::Handle;

use crate::error::{ConduitError, Result};

/// Job submitted by the conduit: the engine's task plus its completion hook
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskExecutor: Send + Sync {
    /// Run `job` eventually, or refuse it with `DelegatedTaskRejected`.
    fn execute(&self, job: Job) -> Result<()>;
}

/// Runs jobs on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}

/// Runs jobs on tokio's blocking thread pool with an admission bound
#[derive(Debug, Clone)]
pub struct BlockingPoolExecutor {
    handle: Handle,
    max_outstanding: usize,
    outstanding: Arc<AtomicUsize>,
}

struct Admission(Arc<AtomicUsize>);

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BlockingPoolExecutor {
    pub fn new(handle: Handle, max_outstanding: usize) -> Self {
        Self {
            handle,
            max_outstanding,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind to the runtime of the calling context
    pub fn current(max_outstanding: usize) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| ConduitError::Config(format!("no tokio runtime for delegated tasks: {}", e)))?;
        Ok(Self::new(handle, max_outstanding))
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl TaskExecutor for BlockingPoolExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        let admitted = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_outstanding).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            return Err(ConduitError::DelegatedTaskRejected);
        }

        let admission = Admission(self.outstanding.clone());
        self.handle.spawn_blocking(move || {
            let _admission = admission;
            job();
        });
        Ok(())
    }
}
