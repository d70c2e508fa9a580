//! Job queue
//!
//! A single named FIFO for slow hardware operations that must stay off the poll
//! path. One consumer runs jobs strictly in submission order; the queue lock covers
//! only push and pop, never a running job. Only one queue may be active per process.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cm_error::{ChassisError, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info};

static QUEUE_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Runs to completion on the consumer thread
    Blocking,
    /// Would run detached from the consumer; not accepted
    Detached,
}

pub struct Job {
    name: String,
    kind: JobKind,
    work: Box<dyn FnOnce() + Send>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        kind: JobKind,
        work: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { name: name.into(), kind, work: Box::new(work) }
    }

    pub fn blocking(name: impl Into<String>, work: impl FnOnce() + Send + 'static) -> Self {
        Self::new(name, JobKind::Blocking, work)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("name", &self.name).field("kind", &self.kind).finish()
    }
}

#[derive(Debug)]
pub struct JobQueue {
    name: String,
    jobs: Mutex<VecDeque<Job>>,
}

impl JobQueue {
    /// Create the process-wide queue. Fails while another queue is alive.
    pub fn create(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        if QUEUE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChassisError::JobQueueActive(name));
        }
        info!(queue = %name, "Job queue created");
        Ok(Arc::new(Self { name, jobs: Mutex::new(VecDeque::new()) }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job; anything but a blocking job is rejected
    pub fn push(&self, job: Job) -> Result<()> {
        if job.kind != JobKind::Blocking {
            return Err(ChassisError::JobRejected {
                name: job.name,
                reason: "only blocking jobs are supported".into(),
            });
        }
        debug!(queue = %self.name, job = %job.name, "Job queued");
        self.jobs.lock().push_back(job);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Pop and run the front job. Returns false when the queue was empty.
    pub fn run_next(&self) -> bool {
        let Some(job) = self.jobs.lock().pop_front() else {
            return false;
        };
        debug!(queue = %self.name, job = %job.name, "Running job");
        if panic::catch_unwind(AssertUnwindSafe(job.work)).is_err() {
            error!(queue = %self.name, job = %job.name, "Job panicked");
        }
        true
    }

    /// Consumer loop: run jobs in order, sleeping `idle` while empty, until `shutdown`
    pub fn run_consumer(&self, shutdown: &AtomicBool, idle: Duration) {
        info!(queue = %self.name, "Job consumer started");
        while !shutdown.load(Ordering::SeqCst) {
            if !self.run_next() {
                thread::sleep(idle);
            }
        }
        info!(queue = %self.name, pending = self.len(), "Job consumer stopped");
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        QUEUE_ACTIVE.store(false, Ordering::Release);
    }
}
