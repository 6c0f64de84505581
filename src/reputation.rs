//! Bounded reputation scoring.
//!
//! Scores live in `[0, MAX_REPUTATION]`. Every update saturates at both
//! bounds; nothing here can wrap. Success and SLA breach are independent
//! inputs: a correct but late answer earns the reward and pays the SLA
//! penalty in the same update (net −10 with the default deltas).

use serde::{Deserialize, Serialize};

use crate::constants::{
    FAILURE_PENALTY, MAX_REPUTATION, SLA_DEACTIVATION_THRESHOLD, SLA_PENALTY, SUCCESS_REWARD,
};
use crate::registry::AgentRecord;

/// What one verification pass says about one agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub sla_violation: bool,
}

/// Effect of a single [`apply_outcome`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationChange {
    pub score_before: u32,
    pub score_after: u32,
    /// True only on the call that crossed the SLA threshold.
    pub deactivated: bool,
}

impl ReputationChange {
    pub fn delta(&self) -> i64 {
        self.score_after as i64 - self.score_before as i64
    }
}

fn reward(score: u32, amount: u32) -> u32 {
    score.saturating_add(amount).min(MAX_REPUTATION)
}

fn penalize(score: u32, amount: u32) -> u32 {
    score.saturating_sub(amount)
}

/// Apply one outcome to an agent's counters.
pub fn apply_outcome(agent: &mut AgentRecord, outcome: Outcome) -> ReputationChange {
    let score_before = agent.reputation_score;
    // A record restored from a corrupted store must still come out in range.
    let mut score = score_before.min(MAX_REPUTATION);

    agent.total_tasks = agent.total_tasks.saturating_add(1);

    if outcome.success {
        agent.successful_tasks = agent.successful_tasks.saturating_add(1);
        score = reward(score, SUCCESS_REWARD);
    } else {
        score = penalize(score, FAILURE_PENALTY);
    }

    let mut deactivated = false;
    if outcome.sla_violation {
        agent.sla_violation_count = agent.sla_violation_count.saturating_add(1);
        score = penalize(score, SLA_PENALTY);
        if agent.sla_violation_count >= SLA_DEACTIVATION_THRESHOLD && agent.is_active {
            agent.is_active = false;
            deactivated = true;
        }
    }

    agent.reputation_score = score;
    ReputationChange {
        score_before,
        score_after: score,
        deactivated,
    }
}

/// Whether an agent is locked out by its SLA history.
pub fn is_sla_suspended(agent: &AgentRecord) -> bool {
    agent.sla_violation_count >= SLA_DEACTIVATION_THRESHOLD
}
