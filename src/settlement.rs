//! Escrow ledger and the settle-once state machine.
//!
//! ```text
//!   lock_payment ──► Locked ──┬─► Released   (seller paid)
//!                             └─► Refunded   (buyer repaid)
//! ```
//!
//! Both terminal states are final. Each transition is a single
//! compare-and-swap on the escrow record, so concurrent or repeated settle
//! calls for one task resolve to exactly one success and `AlreadySettled`
//! for everyone else. Balances are derived from settled escrows rather than
//! kept as a second record, so a crash can never leave a transition without
//! its credit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::crypto::keys::Address;
use crate::store::{get_record, update_record, KvStore, StoreError, Tree};
use crate::TaskId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Locked,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EscrowStatus::Locked)
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EscrowStatus::Locked => "locked",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        })
    }
}

/// Persisted escrow for one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowEntry {
    pub task_id: TaskId,
    pub buyer: Address,
    pub seller: Address,
    /// Smallest-unit amount.
    pub amount: u64,
    pub created_at_ms: u64,
    pub status: EscrowStatus,
    pub settled_at_ms: Option<u64>,
}

/// Emitted once per successful transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum EscrowEvent {
    PaymentLocked {
        task_id: TaskId,
        buyer: Address,
        seller: Address,
        amount: u64,
    },
    PaymentReleased {
        task_id: TaskId,
        seller: Address,
        amount: u64,
    },
    PaymentRefunded {
        task_id: TaskId,
        buyer: Address,
        amount: u64,
    },
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("task {0} already has an escrow")]
    AlreadyLocked(TaskId),
    #[error("no escrow for task {0}")]
    UnknownTask(TaskId),
    #[error("task {task_id} already settled ({status})")]
    AlreadySettled { task_id: TaskId, status: EscrowStatus },
    #[error("escrow amount must be positive")]
    InvalidAmount,
    #[error("{0} may not settle escrows")]
    Unauthorized(Address),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Escrow action chosen for a verification verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementAction {
    Release,
    Refund,
}

impl SettlementAction {
    /// `passed ⇒ Release`, otherwise `Refund`.
    pub fn for_verdict(passed: bool) -> Self {
        if passed {
            SettlementAction::Release
        } else {
            SettlementAction::Refund
        }
    }

    fn target(&self) -> EscrowStatus {
        match self {
            SettlementAction::Release => EscrowStatus::Released,
            SettlementAction::Refund => EscrowStatus::Refunded,
        }
    }
}

/// Escrow ledger over one store namespace.
pub struct EscrowLedger<S: KvStore> {
    store: Arc<S>,
    orchestrator: Address,
    events: broadcast::Sender<EscrowEvent>,
}

impl<S: KvStore> EscrowLedger<S> {
    /// `orchestrator` is the only identity allowed to settle.
    pub fn new(store: Arc<S>, orchestrator: Address) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EscrowLedger {
            store,
            orchestrator,
            events,
        }
    }

    pub fn orchestrator(&self) -> Address {
        self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.events.subscribe()
    }

    /// Lock `amount` from `buyer` for `task_id`, payable to `seller`.
    pub fn lock_payment(
        &self,
        buyer: Address,
        task_id: TaskId,
        seller: Address,
        amount: u64,
    ) -> Result<EscrowEntry, EscrowError> {
        if amount == 0 {
            return Err(EscrowError::InvalidAmount);
        }
        let entry = update_record(self.store.as_ref(), Tree::Escrows, &task_id.0, |current| {
            match current {
                Some(_) => Err(EscrowError::AlreadyLocked(task_id)),
                None => Ok(EscrowEntry {
                    task_id,
                    buyer,
                    seller,
                    amount,
                    created_at_ms: crate::now_ms(),
                    status: EscrowStatus::Locked,
                    settled_at_ms: None,
                }),
            }
        })?;
        self.store.flush()?;

        tracing::info!(
            task = %task_id,
            buyer = %buyer.short(),
            seller = %seller.short(),
            amount,
            "Payment locked"
        );
        self.emit(EscrowEvent::PaymentLocked {
            task_id,
            buyer,
            seller,
            amount,
        });
        Ok(entry)
    }

    pub fn release_payment(&self, caller: Address, task_id: TaskId) -> Result<EscrowEntry, EscrowError> {
        self.settle(caller, task_id, SettlementAction::Release)
    }

    pub fn refund_payment(&self, caller: Address, task_id: TaskId) -> Result<EscrowEntry, EscrowError> {
        self.settle(caller, task_id, SettlementAction::Refund)
    }

    /// Move a locked escrow to its terminal state.
    pub fn settle(
        &self,
        caller: Address,
        task_id: TaskId,
        action: SettlementAction,
    ) -> Result<EscrowEntry, EscrowError> {
        if caller != self.orchestrator {
            tracing::warn!(caller = %caller.short(), task = %task_id, "Unauthorized settlement attempt");
            return Err(EscrowError::Unauthorized(caller));
        }

        let entry = update_record(self.store.as_ref(), Tree::Escrows, &task_id.0, |current| {
            let mut entry: EscrowEntry = current.ok_or(EscrowError::UnknownTask(task_id))?;
            if entry.status.is_terminal() {
                return Err(EscrowError::AlreadySettled {
                    task_id,
                    status: entry.status,
                });
            }
            entry.status = action.target();
            entry.settled_at_ms = Some(crate::now_ms());
            Ok(entry)
        })?;
        self.store.flush()?;

        match action {
            SettlementAction::Release => {
                tracing::info!(task = %task_id, seller = %entry.seller.short(), amount = entry.amount, "Payment released");
                self.emit(EscrowEvent::PaymentReleased {
                    task_id,
                    seller: entry.seller,
                    amount: entry.amount,
                });
            }
            SettlementAction::Refund => {
                tracing::info!(task = %task_id, buyer = %entry.buyer.short(), amount = entry.amount, "Payment refunded");
                self.emit(EscrowEvent::PaymentRefunded {
                    task_id,
                    buyer: entry.buyer,
                    amount: entry.amount,
                });
            }
        }
        Ok(entry)
    }

    pub fn get_escrow(&self, task_id: &TaskId) -> Result<Option<EscrowEntry>, EscrowError> {
        Ok(get_record(self.store.as_ref(), Tree::Escrows, &task_id.0)?)
    }

    pub fn escrow_count(&self) -> Result<usize, EscrowError> {
        Ok(self.store.len(Tree::Escrows)?)
    }

    /// Total paid out to `address`: releases as seller plus refunds as buyer.
    pub fn balance_of(&self, address: &Address) -> Result<u128, EscrowError> {
        let mut total: u128 = 0;
        for (_, bytes) in self.store.scan(Tree::Escrows)? {
            let entry: EscrowEntry = crate::deserialize(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let credited = match entry.status {
                EscrowStatus::Released => entry.seller == *address,
                EscrowStatus::Refunded => entry.buyer == *address,
                EscrowStatus::Locked => false,
            };
            if credited {
                total = total.saturating_add(entry.amount as u128);
            }
        }
        Ok(total)
    }

    fn emit(&self, event: EscrowEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
