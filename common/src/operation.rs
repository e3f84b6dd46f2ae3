//! Operation kinds and the per-call lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WalletError};

/// Kind of balance-changing operation, as recorded in the audit log and
/// carried by notification events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    /// One leg of a currency exchange.
    Transfer,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "DEPOSIT",
            OperationKind::Withdraw => "WITHDRAW",
            OperationKind::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEPOSIT" => Ok(OperationKind::Deposit),
            "WITHDRAW" => Ok(OperationKind::Withdraw),
            "TRANSFER" => Ok(OperationKind::Transfer),
            other => Err(WalletError::validation(format!(
                "unknown operation kind: {other:?}"
            ))),
        }
    }
}

/// Lifecycle stage of a single ledger mutation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStage {
    /// Request accepted and validated.
    Start,
    /// Waiting for a store connection.
    AcquireConnection,
    /// Store transaction is open.
    BeginTx,
    /// Applying a conditional balance update.
    Mutate,
    /// Appending the audit record for the last mutation.
    Audit,
    /// Writing the notification outbox row.
    Notify,
    /// Committing the transaction.
    Commit,
    /// Committed.
    Done,
    /// Rolling back after a failure inside the transaction.
    Rollback,
    /// Finished without committing.
    Failed,
}

impl OperationStage {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, OperationStage::Done | OperationStage::Failed)
    }

    /// Get valid next stages from the current one.
    pub fn valid_transitions(&self) -> &[OperationStage] {
        match self {
            OperationStage::Start => &[OperationStage::AcquireConnection, OperationStage::Failed],
            OperationStage::AcquireConnection => {
                &[OperationStage::BeginTx, OperationStage::Failed]
            }
            OperationStage::BeginTx => &[OperationStage::Mutate, OperationStage::Rollback],
            OperationStage::Mutate => &[
                OperationStage::Mutate,
                OperationStage::Audit,
                OperationStage::Rollback,
            ],
            OperationStage::Audit => &[
                OperationStage::Notify,
                OperationStage::Commit,
                OperationStage::Rollback,
            ],
            OperationStage::Notify => &[OperationStage::Commit, OperationStage::Rollback],
            OperationStage::Commit => &[OperationStage::Done, OperationStage::Failed],
            OperationStage::Rollback => &[OperationStage::Failed],
            OperationStage::Done => &[],
            OperationStage::Failed => &[],
        }
    }

    /// Check if transition to given stage is valid.
    pub fn can_transition_to(&self, next: OperationStage) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Error when attempting an invalid stage transition.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: OperationStage,
    pub to: OperationStage,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid stage transition from {:?} to {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Tracks the stage of one in-flight operation.
#[derive(Debug, Clone)]
pub struct OperationProgress {
    pub kind: OperationKind,
    stage: OperationStage,
}

impl OperationProgress {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            stage: OperationStage::Start,
        }
    }

    pub fn stage(&self) -> OperationStage {
        self.stage
    }

    /// Move to the next stage.
    pub fn transition_to(&mut self, next: OperationStage) -> std::result::Result<(), InvalidTransition> {
        if !self.stage.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }
}
