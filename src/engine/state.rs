//! Coordinator state machine.
//!
//! The transition functions are pure so the table can be tested without
//! running any step.

/// Where a saga currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    /// Executing the step at this chain index for the first time.
    Running { step: usize },
    /// Re-executing the same step after a retry; `retries` is the saga's
    /// retry count so far.
    Retrying { step: usize, retries: u32 },
    /// Unwinding; `depth` compensators are left on the stack.
    Compensating { depth: usize },
    Done,
}

/// Coordinator's reading of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Retry,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub chain_len: usize,
    pub max_retries: u32,
}

impl SagaState {
    pub fn start(chain_len: usize) -> Self {
        if chain_len == 0 {
            SagaState::Done
        } else {
            SagaState::Running { step: 0 }
        }
    }

    /// Chain index to execute next, if the saga is moving forward.
    pub fn current_step(self) -> Option<usize> {
        match self {
            SagaState::Running { step } | SagaState::Retrying { step, .. } => Some(step),
            SagaState::Compensating { .. } | SagaState::Done => None,
        }
    }

    /// Transition after a step attempt.
    ///
    /// `retries` is the retry count after this attempt was accounted for and
    /// `depth` the size of the compensation stack.
    #[must_use]
    pub fn after_step(self, verdict: Verdict, retries: u32, depth: usize, limits: Limits) -> Self {
        let Some(step) = self.current_step() else {
            return self;
        };
        match verdict {
            Verdict::Passed if step + 1 >= limits.chain_len => SagaState::Done,
            Verdict::Passed => SagaState::Running { step: step + 1 },
            Verdict::Retry if retries > limits.max_retries => Self::unwind(depth),
            Verdict::Retry => SagaState::Retrying { step, retries },
            Verdict::Failed => Self::unwind(depth),
        }
    }

    /// Transition after one compensator ran.
    #[must_use]
    pub fn after_compensation(self) -> Self {
        match self {
            SagaState::Compensating { depth } => Self::unwind(depth.saturating_sub(1)),
            other => other,
        }
    }

    fn unwind(depth: usize) -> Self {
        if depth == 0 {
            SagaState::Done
        } else {
            SagaState::Compensating { depth }
        }
    }
}
