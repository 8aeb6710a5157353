//! The per-saga transaction record and the identifiers it logs.

use std::fmt;
use std::sync::Arc;

use crate::engine::compensator::Compensator;
use crate::model::TransferRequest;

/// Identity of each forward step, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    ValidateParties,
    AcquireSenderLock,
    DebitSender,
    AcquireReceiverLock,
    CreditReceiver,
    AcquireQuota,
    FinalizeAndRelease,
}

impl StepId {
    pub const ALL: [StepId; 7] = [
        StepId::ValidateParties,
        StepId::AcquireSenderLock,
        StepId::DebitSender,
        StepId::AcquireReceiverLock,
        StepId::CreditReceiver,
        StepId::AcquireQuota,
        StepId::FinalizeAndRelease,
    ];

    /// Position in the standard chain.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::ValidateParties => "validate_parties",
            StepId::AcquireSenderLock => "acquire_sender_lock",
            StepId::DebitSender => "debit_sender",
            StepId::AcquireReceiverLock => "acquire_receiver_lock",
            StepId::CreditReceiver => "credit_receiver",
            StepId::AcquireQuota => "acquire_quota",
            StepId::FinalizeAndRelease => "finalize_and_release",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Who produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionId {
    Step(StepId),
    Compensator(Compensator),
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionId::Step(step) => fmt::Display::fmt(step, f),
            ActionId::Compensator(compensator) => fmt::Display::fmt(compensator, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Pass,
    Fail,
    Retry,
    /// Retry budget exhausted; terminal like `Fail`.
    Escalate,
    Compensate,
    /// A compensator could not undo its step; the unwind went on regardless.
    CompensationFailed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Retry => "RETRY",
            Outcome::Escalate => "ESCALATE",
            Outcome::Compensate => "COMPENSATE",
            Outcome::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub id: ActionId,
    pub outcome: Outcome,
}

/// Accumulator flowing through the chain for one saga.
///
/// `actions` and `logs` are index-aligned: every append goes through
/// [`TransactionRecord::push`], which writes one of each.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    transaction_id: String,
    request: Arc<TransferRequest>,
    actions: Vec<Action>,
    logs: Vec<String>,
    failed: bool,
    retry_count: u32,
}

impl TransactionRecord {
    pub fn new(transaction_id: impl Into<String>, request: TransferRequest) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            request: Arc::new(request),
            actions: Vec::new(),
            logs: Vec::new(),
            failed: false,
            retry_count: 0,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub(crate) fn shared_request(&self) -> Arc<TransferRequest> {
        Arc::clone(&self.request)
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    /// Paired `(id, outcome, log line)` sequence in execution order.
    pub fn entries(&self) -> impl Iterator<Item = (ActionId, Outcome, &str)> + '_ {
        self.actions
            .iter()
            .zip(&self.logs)
            .map(|(action, line)| (action.id, action.outcome, line.as_str()))
    }

    pub fn last_outcome(&self) -> Option<Outcome> {
        self.actions.last().map(|action| action.outcome)
    }

    /// Compensators that ran, in the order they ran.
    pub fn compensations(&self) -> impl Iterator<Item = Compensator> + '_ {
        self.actions.iter().filter_map(|action| match action.id {
            ActionId::Compensator(compensator) => Some(compensator),
            ActionId::Step(_) => None,
        })
    }

    /// Number of times `step` was attempted.
    pub fn attempts(&self, step: StepId) -> usize {
        self.actions
            .iter()
            .filter(|action| action.id == ActionId::Step(step))
            .count()
    }

    pub fn escalated(&self) -> bool {
        self.actions
            .iter()
            .any(|action| action.outcome == Outcome::Escalate)
    }

    pub(crate) fn push(&mut self, id: ActionId, outcome: Outcome, line: impl Into<String>) {
        self.actions.push(Action { id, outcome });
        self.logs.push(line.into());
    }

    /// Turn the latest entry into an escalation, keeping one entry per
    /// attempt.
    pub(crate) fn escalate_last(&mut self, reason: impl Into<String>) {
        if let (Some(action), Some(line)) = (self.actions.last_mut(), self.logs.last_mut()) {
            action.outcome = Outcome::Escalate;
            line.push_str("; ");
            line.push_str(&reason.into());
        }
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Bump the retry counter and return the new value.
    pub(crate) fn increment_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }
}

impl fmt::Display for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Transaction ID : {}", self.transaction_id)?;
        writeln!(f, "Failed         : {}", self.failed)?;
        writeln!(f, "Retries        : {}", self.retry_count)?;
        for (id, outcome, line) in self.entries() {
            writeln!(f, "{id:<24} {outcome:<20} {line}")?;
        }
        Ok(())
    }
}
