//! Saga coordinator.
//!
//! The engine drives one transfer at a time through the fixed step chain,
//! keeps the compensation stack, and unwinds it in LIFO order when a step
//! fails. Many sagas may run at once; they share the resources and the
//! per-step worker pools.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_stream::{Stream, StreamExt};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::Amount;
use crate::config::SagaConfig;
use crate::ids::{IdGenerator, RandomIds};
use crate::model::{Party, TransferRequest};
use crate::resources::{LedgerError, Resources};

mod compensator;
mod error;
mod record;
mod state;
mod step;
mod worker;

pub use compensator::Compensator;
pub use error::{Role, StepError, WorkerError};
pub use record::{Action, ActionId, Outcome, StepId, TransactionRecord};
pub use state::{Limits, SagaState, Verdict};
pub use step::{
    AcquireQuota, AcquireReceiverLock, AcquireSenderLock, ArmGuard, Chain, CreditReceiver,
    DebitSender, FinalizeAndRelease, Step, StepContext, StepEffect, ValidateParties,
};
pub use worker::{WorkerPool, WorkerPools};

struct Inner {
    config: SagaConfig,
    resources: Resources,
    chain: Chain,
    workers: WorkerPools,
    ids: Arc<dyn IdGenerator>,
}

/// The saga coordinator.
///
/// Cloning is cheap and shares resources, chain and worker pools.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

/// Public API
impl Engine {
    /// Engine with default configuration and fresh resources.
    pub fn new() -> Self {
        Self::with_config(SagaConfig::default())
    }

    pub fn with_config(config: SagaConfig) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(RandomIds);
        let resources = Resources::from_config(&config, Arc::clone(&ids));
        Self::from_parts(config, resources, ids, Chain::standard())
    }

    /// Engine over explicitly constructed collaborators.
    pub fn from_parts(
        config: SagaConfig,
        resources: Resources,
        ids: Arc<dyn IdGenerator>,
        chain: Chain,
    ) -> Self {
        let workers = WorkerPools::new(&config.pools);
        Self {
            inner: Arc::new(Inner {
                config,
                resources,
                chain,
                workers,
                ids,
            }),
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.inner.config
    }

    pub fn resources(&self) -> &Resources {
        &self.inner.resources
    }

    pub fn chain(&self) -> &Chain {
        &self.inner.chain
    }

    /// Seed an account before any saga references it.
    pub fn register(&self, party: &Party) -> Result<(), LedgerError> {
        self.inner.resources.ledger.register(party)
    }

    pub fn balance(&self, party: &Party) -> Result<Amount, LedgerError> {
        self.inner.resources.ledger.balance(&party.key())
    }

    /// Start the quota refill task if the configuration asks for one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_quota_refill(&self) -> Option<JoinHandle<()>> {
        self.inner
            .config
            .quota_refill_interval
            .map(|interval| self.inner.resources.quota.spawn_refill(interval))
    }

    /// Run one transfer saga to completion, compensation included.
    ///
    /// Anticipated failures never surface as errors: the returned record's
    /// `failed` flag and log tell what happened.
    pub async fn run_saga(&self, request: TransferRequest) -> TransactionRecord {
        let tx_id = self.inner.ids.generate_transaction_id();
        let span = info_span!("saga", tx_id = %tx_id);
        self.drive(TransactionRecord::new(tx_id, request))
            .instrument(span)
            .await
    }

    /// Run a saga for every request of `stream` concurrently.
    ///
    /// Records are returned in completion order.
    pub async fn run(
        &self,
        mut stream: impl Stream<Item = TransferRequest> + Unpin,
    ) -> Vec<TransactionRecord> {
        let mut sagas = JoinSet::new();
        while let Some(request) = stream.next().await {
            let engine = self.clone();
            sagas.spawn(async move { engine.run_saga(request).await });
        }

        let mut records = Vec::with_capacity(sagas.len());
        while let Some(joined) = sagas.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(err) => error!(error = %err, "saga task did not finish"),
            }
        }
        records
    }
}

/// Private API
impl Engine {
    async fn drive(&self, mut record: TransactionRecord) -> TransactionRecord {
        let config = &self.inner.config;
        let chain = &self.inner.chain;
        let limits = Limits {
            chain_len: chain.len(),
            max_retries: config.max_retries,
        };
        let mut stack: Vec<Compensator> = Vec::new();
        let mut state = SagaState::start(chain.len());

        loop {
            state = match state {
                SagaState::Running { step: index } | SagaState::Retrying { step: index, .. } => {
                    let Some(step) = chain.get(index) else {
                        break;
                    };
                    let (next, armed) = self.execute_step(step, record).await;
                    record = next;

                    // armed means the resource mutation happened, whatever
                    // the step's reported outcome
                    if armed {
                        if let Some(compensator) = step.compensator() {
                            stack.push(compensator);
                        }
                    }

                    let verdict = match record.last_outcome() {
                        Some(Outcome::Pass) => Verdict::Passed,
                        Some(Outcome::Retry) => Verdict::Retry,
                        _ => Verdict::Failed,
                    };
                    if verdict == Verdict::Retry {
                        self.account_retry(step.id(), &mut record).await;
                    }
                    state.after_step(verdict, record.retry_count(), stack.len(), limits)
                }
                SagaState::Compensating { .. } => {
                    let Some(compensator) = stack.pop() else {
                        break;
                    };
                    record = self.compensate(compensator, record).await;
                    state.after_compensation()
                }
                SagaState::Done => break,
            };
        }

        if record.failed() {
            warn!(
                retries = record.retry_count(),
                compensations = record.compensations().count(),
                escalated = record.escalated(),
                "saga failed"
            );
        } else {
            info!(
                amount = %record.request().amount,
                sender = %record.request().sender.key(),
                receiver = %record.request().receiver.key(),
                retries = record.retry_count(),
                "saga completed"
            );
        }
        record
    }

    /// Count a retry; escalate once the budget is exceeded, otherwise back off.
    async fn account_retry(&self, id: StepId, record: &mut TransactionRecord) {
        let max_retries = self.inner.config.max_retries;
        let retries = record.increment_retry();
        if retries > max_retries {
            warn!(step = %id, retries, "retry budget exhausted");
            record.mark_failed();
            record.escalate_last(format!(
                "escalated: retry budget of {max_retries} exhausted"
            ));
            return;
        }
        let backoff = self.inner.config.retry_backoff;
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
    }

    /// Execute one step and append its outcome to `record`.
    ///
    /// Returns the record and whether the step's resource mutation took
    /// effect, which is what arms its compensator. A record that already
    /// failed is returned untouched.
    async fn execute_step(
        &self,
        step: &Arc<dyn Step>,
        mut record: TransactionRecord,
    ) -> (TransactionRecord, bool) {
        if record.failed() {
            return (record, false);
        }

        let id = step.id();
        let guard = ArmGuard::default();
        let ctx = StepContext {
            transaction_id: record.transaction_id().to_string(),
            resources: self.inner.resources.clone(),
            request: record.shared_request(),
            retry_count: record.retry_count(),
            max_retries: self.inner.config.max_retries,
            guard: guard.clone(),
        };
        let job = {
            let step = Arc::clone(step);
            move || step.apply(&ctx)
        };

        let limit = self.inner.config.step_timeout;
        let pool = self.inner.workers.for_step(id);
        let result = match timeout(limit, pool.run(job)).await {
            Ok(joined) => joined,
            Err(_) => Err(WorkerError::TimedOut(limit)),
        };
        let armed = guard.settle();

        match result {
            Ok(Ok(StepEffect::Pass(line))) => {
                debug!(step = %id, "{line}");
                record.push(ActionId::Step(id), Outcome::Pass, line);
            }
            Ok(Ok(StepEffect::Retry(line))) => {
                debug!(step = %id, retries = record.retry_count(), "{line}");
                record.push(ActionId::Step(id), Outcome::Retry, line);
            }
            Ok(Err(err)) => {
                if err.is_unexpected() {
                    error!(step = %id, error = %err, "step failed unexpectedly");
                } else {
                    warn!(step = %id, reason = %err, "step failed");
                }
                record.mark_failed();
                record.push(ActionId::Step(id), err.outcome(), err.to_string());
            }
            Err(err) => {
                error!(step = %id, error = %err, armed, "step did not complete");
                record.mark_failed();
                record.push(ActionId::Step(id), Outcome::Fail, err.to_string());
            }
        }
        (record, armed)
    }

    /// Run one compensator and append its outcome. Never fails the unwind.
    ///
    /// A timed-out undo is abandoned unless it already committed, in which
    /// case it is recorded as applied.
    async fn compensate(
        &self,
        compensator: Compensator,
        mut record: TransactionRecord,
    ) -> TransactionRecord {
        let guard = ArmGuard::default();
        let ctx = StepContext {
            transaction_id: record.transaction_id().to_string(),
            resources: self.inner.resources.clone(),
            request: record.shared_request(),
            retry_count: record.retry_count(),
            max_retries: self.inner.config.max_retries,
            guard: guard.clone(),
        };
        let job = move || compensator.undo(&ctx);

        let limit = self.inner.config.step_timeout;
        let pool = self.inner.workers.compensation();
        let result = match timeout(limit, pool.run(job)).await {
            Ok(joined) => joined,
            Err(_) => Err(WorkerError::TimedOut(limit)),
        };
        let applied = guard.settle();

        let id = ActionId::Compensator(compensator);
        match result {
            Ok(Ok(line)) => {
                debug!(compensator = %compensator, "{line}");
                record.push(id, Outcome::Compensate, line);
            }
            Ok(Err(err)) => {
                error!(compensator = %compensator, error = %err, "compensation failed");
                record.push(id, Outcome::CompensationFailed, err.to_string());
            }
            Err(err) if applied => {
                warn!(
                    compensator = %compensator,
                    error = %err,
                    "compensation applied but its worker did not report back"
                );
                record.push(
                    id,
                    Outcome::Compensate,
                    format!("{compensator} applied, worker {err}"),
                );
            }
            Err(err) => {
                error!(compensator = %compensator, error = %err, "compensation did not complete");
                record.push(id, Outcome::CompensationFailed, err.to_string());
            }
        }
        record
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("resources", &self.inner.resources)
            .field("chain", &self.inner.chain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::Bank;

    // test utils

    fn alice(amount: i64) -> Party {
        Party::new("alice", Bank::BankA, Amount::new(amount))
    }

    fn bob(amount: i64) -> Party {
        Party::new("bob", Bank::BankB, Amount::new(amount))
    }

    fn engine_with(config: SagaConfig, chain: Chain) -> Engine {
        let ids: Arc<dyn IdGenerator> = Arc::new(RandomIds);
        let resources = Resources::from_config(&config, Arc::clone(&ids));
        let engine = Engine::from_parts(config, resources, ids, chain);
        engine.register(&alice(2000)).unwrap();
        engine.register(&bob(1700)).unwrap();
        engine
    }

    fn fast_config() -> SagaConfig {
        SagaConfig::default()
            .with_retry_backoff(Duration::ZERO)
            .with_quota(8, 8)
    }

    fn transfer(amount: i64) -> TransferRequest {
        TransferRequest::new(Amount::new(amount), alice(0), bob(0))
    }

    fn outcomes(record: &TransactionRecord) -> Vec<(ActionId, Outcome)> {
        record.entries().map(|(id, outcome, _)| (id, outcome)).collect()
    }

    /// Step that always reports an empty resource, ignoring the retry budget.
    struct AlwaysRetry;

    impl Step for AlwaysRetry {
        fn id(&self) -> StepId {
            StepId::AcquireQuota
        }

        fn apply(&self, _ctx: &StepContext) -> Result<StepEffect, StepError> {
            Ok(StepEffect::Retry("still empty".to_string()))
        }
    }

    /// Step that fails after the sender lock was taken.
    struct FailAfterLock;

    impl Step for FailAfterLock {
        fn id(&self) -> StepId {
            StepId::FinalizeAndRelease
        }

        fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
            Err(StepError::LockNotHeld(Role::Receiver, ctx.request.receiver.key()))
        }
    }

    #[tokio::test]
    async fn successful_saga_logs_every_step() {
        let engine = engine_with(fast_config(), Chain::standard());
        let record = engine.run_saga(transfer(450)).await;

        assert!(!record.failed());
        let expected: Vec<_> = StepId::ALL
            .into_iter()
            .map(|id| (ActionId::Step(id), Outcome::Pass))
            .collect();
        assert_eq!(outcomes(&record), expected);
        assert_eq!(record.transaction_id().len(), 15);
        assert_eq!(engine.balance(&alice(0)), Ok(Amount::new(1550)));
        assert_eq!(engine.balance(&bob(0)), Ok(Amount::new(2150)));
    }

    #[tokio::test]
    async fn failed_record_is_not_executed() {
        let engine = engine_with(fast_config(), Chain::standard());
        let mut record = TransactionRecord::new("TX", transfer(450));
        record.mark_failed();

        let step = Arc::new(DebitSender) as Arc<dyn Step>;
        let (record, armed) = engine.execute_step(&step, record).await;

        assert!(!armed);
        assert_eq!(record.entries().count(), 0);
        assert_eq!(engine.balance(&alice(0)), Ok(Amount::new(2000)));
    }

    #[tokio::test]
    async fn coordinator_escalates_step_that_ignores_budget() {
        let chain = Chain::new(vec![
            Arc::new(ValidateParties),
            Arc::new(AcquireSenderLock),
            Arc::new(AlwaysRetry),
        ]);
        let engine = engine_with(fast_config(), chain);
        let record = engine.run_saga(transfer(450)).await;

        assert!(record.failed());
        assert!(record.escalated());
        // three retries accepted, the fourth exceeds the budget
        assert_eq!(record.retry_count(), 4);
        assert_eq!(record.attempts(StepId::AcquireQuota), 4);
        let quota: Vec<_> = record
            .entries()
            .filter(|(id, _, _)| *id == ActionId::Step(StepId::AcquireQuota))
            .map(|(_, outcome, _)| outcome)
            .collect();
        assert_eq!(
            quota,
            vec![
                Outcome::Retry,
                Outcome::Retry,
                Outcome::Retry,
                Outcome::Escalate
            ]
        );
        assert_eq!(
            record.compensations().collect::<Vec<_>>(),
            vec![Compensator::ReleaseSenderLock]
        );
        assert!(engine.resources().locks.held().is_empty());
    }

    #[tokio::test]
    async fn custom_chain_failure_unwinds_what_ran() {
        let chain = Chain::new(vec![
            Arc::new(ValidateParties),
            Arc::new(AcquireSenderLock),
            Arc::new(DebitSender),
            Arc::new(FailAfterLock),
        ]);
        let engine = engine_with(fast_config(), chain);
        let record = engine.run_saga(transfer(450)).await;

        assert!(record.failed());
        assert_eq!(
            record.compensations().collect::<Vec<_>>(),
            vec![Compensator::RefundSender, Compensator::ReleaseSenderLock]
        );
        assert_eq!(engine.balance(&alice(0)), Ok(Amount::new(2000)));
        assert!(engine.resources().locks.held().is_empty());
    }

    #[tokio::test]
    async fn step_timeout_fails_and_compensates() {
        let config = fast_config().with_step_timeout(Duration::from_millis(50));
        let engine = engine_with(config, Chain::standard());

        // occupy every quota worker so the quota step never gets a slot
        let quota_pool = engine.inner.workers.for_step(StepId::AcquireQuota);
        let busy = quota_pool
            .semaphore()
            .acquire_many_owned(quota_pool.size() as u32)
            .await
            .unwrap();

        let record = engine.run_saga(transfer(450)).await;
        drop(busy);

        assert!(record.failed());
        let (id, outcome, line) = record
            .entries()
            .find(|(id, _, _)| *id == ActionId::Step(StepId::AcquireQuota))
            .unwrap();
        assert_eq!(id, ActionId::Step(StepId::AcquireQuota));
        assert_eq!(outcome, Outcome::Fail);
        assert!(line.contains("timed out"));

        assert_eq!(
            record.compensations().collect::<Vec<_>>(),
            vec![
                Compensator::RevertReceiverCredit,
                Compensator::ReleaseReceiverLock,
                Compensator::RefundSender,
                Compensator::ReleaseSenderLock,
            ]
        );
        assert_eq!(engine.balance(&alice(0)), Ok(Amount::new(2000)));
        assert_eq!(engine.balance(&bob(0)), Ok(Amount::new(1700)));
        assert!(engine.resources().locks.held().is_empty());
    }

    #[tokio::test]
    async fn timed_out_lock_step_never_leaks_its_lock() {
        let config = fast_config().with_step_timeout(Duration::from_millis(50));
        let engine = engine_with(config, Chain::standard());

        let lock_pool = engine.inner.workers.for_step(StepId::AcquireSenderLock);
        let busy = lock_pool
            .semaphore()
            .acquire_many_owned(lock_pool.size() as u32)
            .await
            .unwrap();

        let record = engine.run_saga(transfer(450)).await;
        drop(busy);

        assert!(record.failed());
        assert_eq!(record.compensations().count(), 0);
        assert!(engine.resources().locks.held().is_empty());
        assert_eq!(engine.balance(&alice(0)), Ok(Amount::new(2000)));
    }

    #[tokio::test]
    async fn compensation_failure_is_logged_and_unwind_continues() {
        let engine = engine_with(fast_config(), Chain::standard());
        let mut record = TransactionRecord::new("TX", transfer(450));
        record.mark_failed();

        // refund of an account that does not exist
        let ghost = TransferRequest::new(
            Amount::new(450),
            Party::new("ghost", Bank::BankC, Amount::ZERO),
            bob(0),
        );
        let mut ghost_record = TransactionRecord::new("TX-ghost", ghost);
        ghost_record.mark_failed();
        let ghost_record = engine
            .compensate(Compensator::RefundSender, ghost_record)
            .await;
        assert_eq!(ghost_record.last_outcome(), Some(Outcome::CompensationFailed));

        engine.resources().locks.lock(&alice(0).key(), "TX");
        record = engine
            .compensate(Compensator::ReleaseSenderLock, record)
            .await;
        assert_eq!(record.last_outcome(), Some(Outcome::Compensate));
        assert!(engine.resources().locks.held().is_empty());
    }

    fn single_blocking_thread() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn late_quota_worker_leaves_pool_untouched() {
        single_blocking_thread().block_on(async {
            let config = fast_config().with_step_timeout(Duration::from_millis(50));
            let engine = engine_with(config, Chain::standard());
            let step = Arc::new(AcquireQuota) as Arc<dyn Step>;

            // the only blocking thread stays busy past the step timeout
            let sleeper = tokio::task::spawn_blocking(|| {
                std::thread::sleep(Duration::from_millis(200));
            });
            let record = TransactionRecord::new("TX", transfer(450));
            let (record, armed) = engine.execute_step(&step, record).await;

            assert!(!armed);
            assert_eq!(record.last_outcome(), Some(Outcome::Fail));

            sleeper.await.unwrap();
            // the queued worker runs now and must be turned away
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(engine.resources().quota.len(), 8);
        });
    }

    #[test]
    fn late_finalize_worker_keeps_locks() {
        single_blocking_thread().block_on(async {
            let config = fast_config().with_step_timeout(Duration::from_millis(50));
            let engine = engine_with(config, Chain::standard());
            let locks = &engine.resources().locks;
            locks.lock(&alice(0).key(), "TX");
            locks.lock(&bob(0).key(), "TX");
            let step = Arc::new(FinalizeAndRelease) as Arc<dyn Step>;

            let sleeper = tokio::task::spawn_blocking(|| {
                std::thread::sleep(Duration::from_millis(200));
            });
            let record = TransactionRecord::new("TX", transfer(450));
            let (record, _) = engine.execute_step(&step, record).await;
            assert_eq!(record.last_outcome(), Some(Outcome::Fail));

            sleeper.await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(locks.held().len(), 2);
        });
    }

    #[test]
    fn late_compensation_is_abandoned_and_logged_as_failed() {
        single_blocking_thread().block_on(async {
            let config = fast_config().with_step_timeout(Duration::from_millis(50));
            let engine = engine_with(config, Chain::standard());
            engine.resources().locks.lock(&bob(0).key(), "TX");
            let mut record = TransactionRecord::new("TX", transfer(450));
            record.mark_failed();

            let sleeper = tokio::task::spawn_blocking(|| {
                std::thread::sleep(Duration::from_millis(200));
            });
            let record = engine
                .compensate(Compensator::ReleaseReceiverLock, record)
                .await;
            assert_eq!(record.last_outcome(), Some(Outcome::CompensationFailed));

            sleeper.await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            // the record says the release failed, and it did
            assert!(engine.resources().locks.is_held_by(&bob(0).key(), "TX"));
        });
    }

    #[tokio::test]
    async fn run_processes_every_request() {
        let engine = engine_with(fast_config(), Chain::standard());
        engine.register(&Party::new("carol", Bank::BankC, Amount::new(500))).unwrap();
        engine.register(&Party::new("dave", Bank::BankA, Amount::new(900))).unwrap();

        let requests = vec![
            transfer(450),
            TransferRequest::new(
                Amount::new(100),
                Party::new("carol", Bank::BankC, Amount::ZERO),
                Party::new("dave", Bank::BankA, Amount::ZERO),
            ),
        ];
        let records = engine.run(tokio_stream::iter(requests)).await;

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| !record.failed()));
        assert_eq!(engine.resources().ledger.total(), Amount::new(2000 + 1700 + 500 + 900));
    }

    #[tokio::test]
    async fn refill_is_started_only_when_configured() {
        let engine = engine_with(fast_config(), Chain::standard());
        assert!(engine.start_quota_refill().is_none());

        let config = fast_config().with_quota_refill(Duration::from_millis(5));
        let engine = engine_with(config, Chain::standard());
        let handle = engine.start_quota_refill().unwrap();
        handle.abort();
    }
}
