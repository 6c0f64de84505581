//! Verification cycle driver.
//!
//! One cycle for one task:
//!
//! ```text
//!   escrow check ─► dispatch ─► identity ─► SLA ─► consensus ─► settle ─► reputation
//! ```
//!
//! Settlement runs before any reputation update. If settlement is rejected
//! (a concurrent run settled first) no score is touched, so re-running a
//! cycle can never double-reward or double-penalize. A cancelled dispatch
//! discards everything collected so far and leaves no state behind.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, CycleConfig, Schedule};
use crate::crypto::keys::Address;
use crate::registry::{normalize_endpoint, AgentRegistry, RegistryError};
use crate::reputation::ReputationChange;
use crate::settlement::{EscrowEntry, EscrowError, EscrowLedger, SettlementAction};
use crate::store::KvStore;
use crate::verification::collector::{self, AgentTransport};
use crate::verification::consensus::{self, VerificationReport};
use crate::verification::{identity, sla};
use crate::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How a cycle ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Released,
    Refunded,
    Cancelled,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CycleOutcome::Released => "released",
            CycleOutcome::Refunded => "refunded",
            CycleOutcome::Cancelled => "cancelled",
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ReputationUpdate {
    pub agent: Address,
    pub success: bool,
    pub sla_violation: bool,
    pub change: ReputationChange,
}

/// A reputation update that was rejected after settlement went through.
#[derive(Clone, Debug, Serialize)]
pub struct ReputationFailure {
    pub agent: Address,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleSummary {
    pub task_id: TaskId,
    pub outcome: CycleOutcome,
    pub report: Option<VerificationReport>,
    pub escrow: Option<EscrowEntry>,
    pub reputation: Vec<ReputationUpdate>,
    pub reputation_failures: Vec<ReputationFailure>,
}

impl CycleSummary {
    fn cancelled(task_id: TaskId) -> Self {
        CycleSummary {
            task_id,
            outcome: CycleOutcome::Cancelled,
            report: None,
            escrow: None,
            reputation: vec![],
            reputation_failures: vec![],
        }
    }
}

/// Drives verification cycles as the orchestrator identity.
pub struct Orchestrator<T: AgentTransport, S: KvStore> {
    identity: Address,
    transport: Arc<T>,
    registry: Arc<AgentRegistry<S>>,
    escrow: Arc<EscrowLedger<S>>,
}

impl<T: AgentTransport, S: KvStore> Orchestrator<T, S> {
    pub fn new(
        identity: Address,
        transport: Arc<T>,
        registry: Arc<AgentRegistry<S>>,
        escrow: Arc<EscrowLedger<S>>,
    ) -> Self {
        Orchestrator {
            identity,
            transport,
            registry,
            escrow,
        }
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    pub fn registry(&self) -> &Arc<AgentRegistry<S>> {
        &self.registry
    }

    pub fn escrow(&self) -> &Arc<EscrowLedger<S>> {
        &self.escrow
    }

    /// Endpoints to dispatch to: the configured list (deduplicated) or, when
    /// empty, every active registered agent.
    pub fn resolve_endpoints(&self, config: &CycleConfig) -> Result<Vec<String>, CycleError> {
        if config.agent_endpoints.is_empty() {
            let endpoints: Vec<String> = self
                .registry
                .active_agents()?
                .into_iter()
                .map(|a| a.metadata_uri)
                .collect();
            tracing::debug!(count = endpoints.len(), "Discovered active agents");
            return Ok(endpoints);
        }
        let mut seen = HashSet::new();
        Ok(config
            .agent_endpoints
            .iter()
            .map(|e| normalize_endpoint(e))
            .filter(|e| !e.is_empty() && seen.insert(e.clone()))
            .collect())
    }

    /// Run one verification cycle for `task_id`.
    ///
    /// Fails before dispatch if the task has no escrow or is already settled.
    pub async fn run_verification_cycle(
        &self,
        task_id: TaskId,
        config: &CycleConfig,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, CycleError> {
        config.validate()?;
        match self.escrow.get_escrow(&task_id)? {
            None => return Err(EscrowError::UnknownTask(task_id).into()),
            Some(entry) if entry.status.is_terminal() => {
                tracing::warn!(task = %task_id, status = %entry.status, "Task already settled, skipping");
                return Err(EscrowError::AlreadySettled {
                    task_id,
                    status: entry.status,
                }
                .into());
            }
            Some(_) => {}
        }

        let endpoints = self.resolve_endpoints(config)?;
        let index = self.registry.endpoint_index()?;
        let owners: HashMap<String, Address> = endpoints
            .iter()
            .filter_map(|e| index.get(e).map(|a| (e.clone(), *a)))
            .collect();

        tracing::info!(task = %task_id, agents = endpoints.len(), "Dispatching task");
        let collection = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(task = %task_id, "Cycle cancelled during dispatch");
                return Ok(CycleSummary::cancelled(task_id));
            }
            c = collector::collect(self.transport.clone(), task_id, &endpoints, config.request_timeout()) => c,
        };

        let verified = identity::verify_identities(
            &task_id,
            collection.results,
            self.registry.as_ref(),
            &owners,
        );
        let sla = config.sla();
        let partition = sla::partition(verified, &sla, collection.dispatch_started_at_ms);
        let report = consensus::evaluate(
            task_id,
            endpoints.len(),
            &partition,
            &sla,
            config.min_agreeing_results,
        );

        let action = SettlementAction::for_verdict(report.passed);
        let escrow = self.escrow.settle(self.identity, task_id, action)?;

        let mut reputation = Vec::with_capacity(report.outcomes.len());
        let mut reputation_failures = Vec::new();
        for o in &report.outcomes {
            match self
                .registry
                .record_outcome(self.identity, o.agent, o.success, o.sla_violation)
            {
                Ok(change) => reputation.push(ReputationUpdate {
                    agent: o.agent,
                    success: o.success,
                    sla_violation: o.sla_violation,
                    change,
                }),
                Err(e) => {
                    tracing::warn!(task = %task_id, agent = %o.agent.short(), error = %e, "Reputation update rejected");
                    reputation_failures.push(ReputationFailure {
                        agent: o.agent,
                        error: e.to_string(),
                    });
                }
            }
        }

        let outcome = match action {
            SettlementAction::Release => CycleOutcome::Released,
            SettlementAction::Refund => CycleOutcome::Refunded,
        };
        tracing::info!(
            task = %task_id,
            outcome = %outcome,
            confidence = report.confidence_score,
            "Verification cycle complete"
        );
        Ok(CycleSummary {
            task_id,
            outcome,
            report: Some(report),
            escrow: Some(escrow),
            reputation,
            reputation_failures,
        })
    }

    /// Run cycles for the configured task on the configured schedule until
    /// `shutdown` fires. Returns immediately for a manual schedule.
    pub async fn run_schedule(&self, config: CycleConfig, shutdown: CancellationToken) {
        let secs = match config.schedule {
            Schedule::Manual => return,
            Schedule::Every(secs) => secs,
        };
        let task_id = match config.task_id.as_deref() {
            Some(label) => TaskId::parse(label),
            None => {
                tracing::warn!("Interval schedule configured without task_id; scheduler idle");
                return;
            }
        };

        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler stopped");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_verification_cycle(task_id, &config, &shutdown).await {
                        Ok(summary) => tracing::info!(task = %task_id, outcome = %summary.outcome, "Scheduled cycle finished"),
                        Err(e) => tracing::warn!(task = %task_id, error = %e, "Scheduled cycle rejected"),
                    }
                }
            }
        }
    }
}
