//! Forward steps of the transfer chain.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::compensator::Compensator;
use crate::engine::error::{Role, StepError};
use crate::Amount;
use crate::engine::record::StepId;
use crate::model::TransferRequest;
use crate::resources::Resources;

#[derive(Debug, Default)]
struct ArmState {
    armed: bool,
    settled: bool,
}

/// Shared between a worker and the coordinator to decide whether a step's
/// or compensator's mutation took effect.
///
/// The worker runs its resource mutation through [`ArmGuard::commit`]; the
/// coordinator calls [`ArmGuard::settle`] once it stops waiting (normal
/// completion or timeout). Both take the same lock, so a mutation either
/// happened before settling and is reported as armed, or never happens.
#[derive(Debug, Clone, Default)]
pub struct ArmGuard(Arc<Mutex<ArmState>>);

impl ArmGuard {
    fn state(&self) -> MutexGuard<'_, ArmState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `mutation` unless the coordinator already settled; arm on success.
    pub fn commit<T>(
        &self,
        mutation: impl FnOnce() -> Result<T, StepError>,
    ) -> Result<T, StepError> {
        let mut state = self.state();
        if state.settled {
            return Err(StepError::Abandoned);
        }
        let value = mutation()?;
        state.armed = true;
        Ok(value)
    }

    /// Stop accepting mutations and report whether one succeeded.
    pub fn settle(&self) -> bool {
        let mut state = self.state();
        state.settled = true;
        state.armed
    }

    pub fn is_armed(&self) -> bool {
        self.state().armed
    }
}

/// Everything a step body may touch, owned so it can move to a worker.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Owner of the locks this saga takes.
    pub transaction_id: String,
    pub resources: Resources,
    pub request: Arc<TransferRequest>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub guard: ArmGuard,
}

/// Successful result of a step body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEffect {
    Pass(String),
    /// Recoverable; the coordinator re-runs the same step.
    Retry(String),
}

/// One link of the chain.
///
/// `apply` runs on the step's worker pool; anticipated failures come back as
/// [`StepError`] and are turned into outcomes by the coordinator. A worker
/// may outlive the step's timeout, so every resource mutation goes through
/// [`ArmGuard::commit`].
pub trait Step: Send + Sync {
    fn id(&self) -> StepId;

    /// Undo action armed when this step's mutation succeeds.
    fn compensator(&self) -> Option<Compensator> {
        None
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError>;
}

pub struct ValidateParties;

impl Step for ValidateParties {
    fn id(&self) -> StepId {
        StepId::ValidateParties
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
        let ledger = &ctx.resources.ledger;
        let request = &ctx.request;
        if request.amount <= Amount::ZERO {
            return Err(StepError::NonPositiveAmount(request.amount));
        }
        if !ledger.exists(&request.sender) {
            return Err(StepError::NotRegistered(Role::Sender, request.sender.key()));
        }
        if !ledger.exists(&request.receiver) {
            return Err(StepError::NotRegistered(
                Role::Receiver,
                request.receiver.key(),
            ));
        }
        Ok(StepEffect::Pass(format!(
            "sender {} and receiver {} are registered",
            request.sender.key(),
            request.receiver.key()
        )))
    }
}

pub struct AcquireSenderLock;

impl Step for AcquireSenderLock {
    fn id(&self) -> StepId {
        StepId::AcquireSenderLock
    }

    fn compensator(&self) -> Option<Compensator> {
        Some(Compensator::ReleaseSenderLock)
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
        let key = ctx.request.sender.key();
        ctx.guard.commit(|| {
            if ctx.resources.locks.lock(&key, &ctx.transaction_id) {
                Ok(())
            } else {
                Err(StepError::AlreadyLocked(Role::Sender, key.clone()))
            }
        })?;
        Ok(StepEffect::Pass(format!(
            "sender account {key} locked for the transfer"
        )))
    }
}

pub struct DebitSender;

impl Step for DebitSender {
    fn id(&self) -> StepId {
        StepId::DebitSender
    }

    fn compensator(&self) -> Option<Compensator> {
        Some(Compensator::RefundSender)
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
        let key = ctx.request.sender.key();
        let amount = ctx.request.amount;
        ctx.guard
            .commit(|| Ok(ctx.resources.ledger.adjust(&key, -amount)?))?;
        Ok(StepEffect::Pass(format!("debited {amount} from sender {key}")))
    }
}

pub struct AcquireReceiverLock;

impl Step for AcquireReceiverLock {
    fn id(&self) -> StepId {
        StepId::AcquireReceiverLock
    }

    fn compensator(&self) -> Option<Compensator> {
        Some(Compensator::ReleaseReceiverLock)
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
        let key = ctx.request.receiver.key();
        ctx.guard.commit(|| {
            if ctx.resources.locks.lock(&key, &ctx.transaction_id) {
                Ok(())
            } else {
                Err(StepError::AlreadyLocked(Role::Receiver, key.clone()))
            }
        })?;
        Ok(StepEffect::Pass(format!(
            "receiver account {key} locked for the transfer"
        )))
    }
}

/// Credits the receiver after re-checking that the receiver's balance covers
/// the transfer amount.
pub struct CreditReceiver;

impl Step for CreditReceiver {
    fn id(&self) -> StepId {
        StepId::CreditReceiver
    }

    fn compensator(&self) -> Option<Compensator> {
        Some(Compensator::RevertReceiverCredit)
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
        let ledger = &ctx.resources.ledger;
        let key = ctx.request.receiver.key();
        let amount = ctx.request.amount;
        ctx.guard.commit(|| {
            let available = ledger.balance(&key)?;
            if available < amount {
                return Err(StepError::InsufficientFunds {
                    key: key.clone(),
                    available,
                    requested: amount,
                });
            }
            Ok(ledger.adjust(&key, amount)?)
        })?;
        Ok(StepEffect::Pass(format!("credited {amount} to receiver {key}")))
    }
}

pub struct AcquireQuota;

impl Step for AcquireQuota {
    fn id(&self) -> StepId {
        StepId::AcquireQuota
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
        let token = ctx.guard.commit(|| Ok(ctx.resources.quota.take_token()))?;
        match token {
            Some(token) => Ok(StepEffect::Pass(format!("took quota token {token}"))),
            None if ctx.retry_count >= ctx.max_retries => {
                Err(StepError::QuotaExhausted(ctx.retry_count))
            }
            None => Ok(StepEffect::Retry(format!(
                "quota pool empty, retry {} of {}",
                ctx.retry_count + 1,
                ctx.max_retries
            ))),
        }
    }
}

/// Releases both locks; both must still be held by this saga.
pub struct FinalizeAndRelease;

impl Step for FinalizeAndRelease {
    fn id(&self) -> StepId {
        StepId::FinalizeAndRelease
    }

    fn apply(&self, ctx: &StepContext) -> Result<StepEffect, StepError> {
        let locks = &ctx.resources.locks;
        let owner = ctx.transaction_id.as_str();
        let sender = ctx.request.sender.key();
        let receiver = ctx.request.receiver.key();

        ctx.guard.commit(|| {
            if !locks.is_held_by(&sender, owner) {
                return Err(StepError::LockNotHeld(Role::Sender, sender.clone()));
            }
            if !locks.is_held_by(&receiver, owner) {
                return Err(StepError::LockNotHeld(Role::Receiver, receiver.clone()));
            }
            locks.unlock(&sender, owner);
            locks.unlock(&receiver, owner);
            Ok(())
        })?;
        Ok(StepEffect::Pass(format!(
            "released locks on {sender} and {receiver}, transfer complete"
        )))
    }
}

/// The fixed, ordered list of steps.
#[derive(Clone)]
pub struct Chain {
    steps: Vec<Arc<dyn Step>>,
}

impl Chain {
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Self {
        Self { steps }
    }

    /// The seven transfer steps in execution order.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(ValidateParties),
            Arc::new(AcquireSenderLock),
            Arc::new(DebitSender),
            Arc::new(AcquireReceiverLock),
            Arc::new(CreditReceiver),
            Arc::new(AcquireQuota),
            Arc::new(FinalizeAndRelease),
        ])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Step>> {
        self.steps.get(index)
    }

    pub fn ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.steps.iter().map(|step| step.id())
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
