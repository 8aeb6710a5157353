//! Fixed-size worker pools, one per step type plus one for compensators.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::PoolSizes;
use crate::engine::error::WorkerError;
use crate::engine::record::StepId;

/// A bounded set of blocking worker slots.
///
/// A job first waits for a free slot, then runs on tokio's blocking thread
/// pool while holding it.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed(self.name))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| WorkerError::Panicked(self.name, err))
    }

    #[cfg(test)]
    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }
}

/// All pools used by the engine.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    steps: Vec<WorkerPool>,
    compensation: WorkerPool,
}

impl WorkerPools {
    pub fn new(sizes: &PoolSizes) -> Self {
        let steps = StepId::ALL
            .into_iter()
            .map(|step| {
                let size = match step {
                    StepId::ValidateParties => sizes.validate,
                    StepId::AcquireSenderLock => sizes.sender_lock,
                    StepId::DebitSender => sizes.debit,
                    StepId::AcquireReceiverLock => sizes.receiver_lock,
                    StepId::CreditReceiver => sizes.credit,
                    StepId::AcquireQuota => sizes.quota,
                    StepId::FinalizeAndRelease => sizes.finalize,
                };
                WorkerPool::new(step.as_str(), size)
            })
            .collect();

        Self {
            steps,
            compensation: WorkerPool::new("compensation", sizes.compensation),
        }
    }

    pub fn for_step(&self, step: StepId) -> &WorkerPool {
        &self.steps[step.index()]
    }

    pub fn compensation(&self) -> &WorkerPool {
        &self.compensation
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn run_returns_job_result() {
        let pool = WorkerPool::new("test", 2);
        let value = pool.run(|| 40 + 2).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn zero_size_is_raised_to_one() {
        assert_eq!(WorkerPool::new("test", 0).size(), 1);
    }

    #[tokio::test]
    async fn panicking_job_is_reported() {
        let pool = WorkerPool::new("boom", 1);
        let result = pool.run(|| -> u32 { panic!("worker died") }).await;
        assert!(matches!(result, Err(WorkerError::Panicked("boom", _))));
        // the slot is released again
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_jobs() {
        let pool = WorkerPool::new("closed", 1);
        pool.semaphore().close();
        let result = pool.run(|| ()).await;
        assert!(matches!(result, Err(WorkerError::Closed("closed"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_pool_size() {
        let pool = WorkerPool::new("bounded", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    pool.run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for job in jobs {
            job.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn pools_follow_configured_sizes() {
        let pools = WorkerPools::new(&PoolSizes::default());
        assert_eq!(pools.for_step(StepId::AcquireSenderLock).size(), 4);
        assert_eq!(pools.for_step(StepId::CreditReceiver).size(), 2);
        assert_eq!(pools.for_step(StepId::AcquireQuota).name(), "acquire_quota");
        assert_eq!(pools.compensation().size(), 2);
    }
}
