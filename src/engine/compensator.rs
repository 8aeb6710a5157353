//! Undo actions for the steps that mutate a resource.

use std::fmt;

use tracing::warn;

use crate::engine::error::{Role, StepError};
use crate::engine::step::StepContext;
use crate::model::AccountKey;

/// An undo action, armed by a step when its mutation succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compensator {
    ReleaseSenderLock,
    RefundSender,
    ReleaseReceiverLock,
    RevertReceiverCredit,
}

impl Compensator {
    pub fn as_str(self) -> &'static str {
        match self {
            Compensator::ReleaseSenderLock => "release_sender_lock",
            Compensator::RefundSender => "refund_sender",
            Compensator::ReleaseReceiverLock => "release_receiver_lock",
            Compensator::RevertReceiverCredit => "revert_receiver_credit",
        }
    }

    /// Undo the bound step's effect and describe what was done.
    ///
    /// Runs against the failed saga's context; every mutation goes through
    /// its guard, so an undo abandoned by the coordinator changes nothing.
    /// Releasing a lock this saga no longer holds is not an error.
    pub fn undo(self, ctx: &StepContext) -> Result<String, StepError> {
        let request = &ctx.request;
        match self {
            Compensator::ReleaseSenderLock => release(ctx, Role::Sender, request.sender.key()),
            Compensator::RefundSender => {
                let key = request.sender.key();
                ctx.guard
                    .commit(|| Ok(ctx.resources.ledger.adjust(&key, request.amount)?))?;
                Ok(format!("refunded {} to sender {key}", request.amount))
            }
            Compensator::ReleaseReceiverLock => {
                release(ctx, Role::Receiver, request.receiver.key())
            }
            Compensator::RevertReceiverCredit => {
                let key = request.receiver.key();
                ctx.guard
                    .commit(|| Ok(ctx.resources.ledger.adjust(&key, -request.amount)?))?;
                Ok(format!("took back {} from receiver {key}", request.amount))
            }
        }
    }
}

fn release(ctx: &StepContext, role: Role, key: AccountKey) -> Result<String, StepError> {
    let released = ctx
        .guard
        .commit(|| Ok(ctx.resources.locks.unlock(&key, &ctx.transaction_id)))?;
    if released {
        Ok(format!("{role} lock on {key} released"))
    } else {
        warn!(key = %key, "{role} lock was not held by this saga");
        Ok(format!("{role} lock on {key} was not held by this saga"))
    }
}

impl fmt::Display for Compensator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
