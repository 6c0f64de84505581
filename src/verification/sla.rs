//! Latency filter between identity checks and the vote.

use serde::{Deserialize, Serialize};

use super::identity::VerifiedResult;
use super::{AgentResult, FailedResult};
use crate::constants::{DEFAULT_MAX_RESPONSE_TIME_MS, DEFAULT_MIN_CONSENSUS_FRACTION};
use crate::crypto::keys::Address;

/// Service level a task is verified against.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sla {
    pub max_response_time_ms: u64,
    pub min_consensus_fraction: f64,
}

impl Default for Sla {
    fn default() -> Self {
        Sla {
            max_response_time_ms: DEFAULT_MAX_RESPONSE_TIME_MS,
            min_consensus_fraction: DEFAULT_MIN_CONSENSUS_FRACTION,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedResult {
    pub result: VerifiedResult,
    pub response_time_ms: u64,
}

/// Verified results split by latency; failures pass through untouched.
///
/// Every list is in arrival order.
#[derive(Clone, Debug, Default)]
pub struct SlaPartition {
    pub on_time: Vec<TimedResult>,
    pub late: Vec<TimedResult>,
    pub failed: Vec<FailedResult>,
}

impl SlaPartition {
    /// Addresses of agents whose verified answer arrived too late.
    pub fn violators(&self) -> Vec<Address> {
        self.late.iter().map(|t| t.result.agent).collect()
    }

    pub fn verified_count(&self) -> usize {
        self.on_time.len() + self.late.len()
    }
}

/// Split verified results into on-time and late.
///
/// `response_time_ms` saturates at zero for timestamps before dispatch.
/// A result exactly at the limit is on time.
pub fn partition(
    results: Vec<AgentResult<VerifiedResult>>,
    sla: &Sla,
    dispatch_started_at_ms: u64,
) -> SlaPartition {
    let mut out = SlaPartition::default();
    for result in results {
        match result {
            AgentResult::Ok(result) => {
                let response_time_ms = result.timestamp_ms.saturating_sub(dispatch_started_at_ms);
                let timed = TimedResult {
                    result,
                    response_time_ms,
                };
                if response_time_ms > sla.max_response_time_ms {
                    tracing::info!(
                        agent = %timed.result.agent.short(),
                        response_time_ms,
                        limit_ms = sla.max_response_time_ms,
                        "SLA violation"
                    );
                    out.late.push(timed);
                } else {
                    out.on_time.push(timed);
                }
            }
            AgentResult::Failed(failed) => out.failed.push(failed),
        }
    }
    out.on_time.sort_by_key(|t| t.result.arrival);
    out.late.sort_by_key(|t| t.result.arrival);
    out.failed.sort_by_key(|f| f.arrival);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::FailureReason;

    fn verified(arrival: usize, agent: u8, timestamp_ms: u64) -> AgentResult<VerifiedResult> {
        AgentResult::Ok(VerifiedResult {
            endpoint: format!("http://agent-{}", agent),
            arrival,
            agent: Address([agent; 32]),
            payload: "x".into(),
            timestamp_ms,
        })
    }

    fn sla(max_ms: u64) -> Sla {
        Sla {
            max_response_time_ms: max_ms,
            ..Sla::default()
        }
    }

    #[test]
    fn late_results_become_violators() {
        let p = partition(
            vec![verified(0, 1, 1_100), verified(1, 2, 1_200), verified(2, 3, 9_000)],
            &sla(500),
            1_000,
        );
        assert_eq!(p.on_time.len(), 2);
        assert_eq!(p.late.len(), 1);
        assert_eq!(p.violators(), vec![Address([3; 32])]);
        assert_eq!(p.late[0].response_time_ms, 8_000);
    }

    #[test]
    fn boundary_is_on_time() {
        let p = partition(vec![verified(0, 1, 1_500)], &sla(500), 1_000);
        assert_eq!(p.on_time.len(), 1);
        assert!(p.late.is_empty());
    }

    #[test]
    fn timestamp_before_dispatch_saturates() {
        let p = partition(vec![verified(0, 1, 10)], &sla(500), 1_000);
        assert_eq!(p.on_time[0].response_time_ms, 0);
    }

    #[test]
    fn failures_pass_through_in_arrival_order() {
        let failed = |arrival| {
            AgentResult::Failed(FailedResult {
                endpoint: format!("e{}", arrival),
                arrival,
                reason: FailureReason::Timeout,
                agent: None,
            })
        };
        let p = partition(
            vec![failed(3), verified(1, 1, 1_000), failed(0), verified(2, 2, 1_000)],
            &sla(500),
            1_000,
        );
        assert_eq!(p.failed.iter().map(|f| f.arrival).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(
            p.on_time.iter().map(|t| t.result.arrival).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(p.verified_count(), 2);
    }
}
