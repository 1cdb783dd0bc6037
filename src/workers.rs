use log::debug;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use commissioner_api::error::{CommissionError, InitializationError, ReportError};

/// Fixed-size pool running one job per host and collecting the results in submission order.
pub struct WorkerPool {
    pool: ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, CommissionError> {
        let size = size.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("commission-worker-{i}"))
            .build()
            .structured(InitializationError::BuildWorkerPool { size })?;
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `job` over every input concurrently, at most `size` at a time.
    ///
    /// The output has one entry per input, in input order, regardless of completion order. Jobs
    /// are expected to report their own failures in `R`.
    pub fn run<J, R, F>(&self, jobs: Vec<J>, job: F) -> Vec<R>
    where
        J: Send,
        R: Send,
        F: Fn(J) -> R + Send + Sync,
    {
        debug!("Running {} job(s) on {} worker(s)", jobs.len(), self.size);
        self.pool.install(|| jobs.into_par_iter().map(&job).collect())
    }
}
