//! Majority agreement over SLA-compliant results.
//!
//! Results are folded into a [`Tally`] before anything is decided. A tally is
//! a commutative monoid: merging partial tallies in any order yields the same
//! groups, and each group remembers the earliest arrival it contains, so the
//! tie-break never depends on iteration order.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use super::sla::{Sla, SlaPartition, TimedResult};
use crate::constants::MIN_AGREEING_RESULTS;
use crate::crypto::keys::Address;
use crate::TaskId;

/// Grouping key for a payload: trimmed and case-folded.
pub fn normalize(payload: &str) -> String {
    payload.trim().to_lowercase()
}

/// All answers sharing one normalized payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub key: String,
    pub count: usize,
    pub first_arrival: usize,
    /// Original payload of the member that arrived first.
    pub representative: String,
}

impl Group {
    fn merge(&mut self, other: Group) {
        self.count += other.count;
        if other.first_arrival < self.first_arrival {
            self.first_arrival = other.first_arrival;
            self.representative = other.representative;
        }
    }
}

/// Per-group counts of a set of answers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    groups: BTreeMap<String, Group>,
    total: usize,
}

impl Tally {
    pub fn single(arrival: usize, payload: &str) -> Tally {
        let key = normalize(payload);
        let mut groups = BTreeMap::new();
        groups.insert(
            key.clone(),
            Group {
                key,
                count: 1,
                first_arrival: arrival,
                representative: payload.to_string(),
            },
        );
        Tally { groups, total: 1 }
    }

    pub fn merge(mut self, other: Tally) -> Tally {
        self.total += other.total;
        for (key, group) in other.groups {
            match self.groups.get_mut(&key) {
                Some(existing) => existing.merge(group),
                None => {
                    self.groups.insert(key, group);
                }
            }
        }
        self
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Largest group; ties go to the group seen first.
    pub fn majority(&self) -> Option<&Group> {
        self.groups.values().min_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.first_arrival.cmp(&b.first_arrival))
        })
    }
}

impl<'a> FromIterator<&'a TimedResult> for Tally {
    fn from_iter<I: IntoIterator<Item = &'a TimedResult>>(iter: I) -> Self {
        iter.into_iter()
            .map(|t| Tally::single(t.result.arrival, &t.result.payload))
            .fold(Tally::default(), Tally::merge)
    }
}

/// Why a pass did not reach consensus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusFailure {
    /// No endpoint was queried at all.
    NoAgents,
    /// Every dispatch failed transport or identity checks.
    NoResponses,
    /// Verified answers exist but every one broke the SLA.
    AllLate,
    /// The largest group is below the confidence threshold.
    BelowThreshold,
    /// The largest group clears the threshold but is too small to trust.
    TooFewAgreeing,
}

/// Per-agent verdict fed to the reputation ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AgentOutcome {
    pub agent: Address,
    pub success: bool,
    pub sla_violation: bool,
    pub response_time_ms: Option<u64>,
}

/// Result of one verification pass.
#[derive(Clone, Debug, Serialize)]
pub struct VerificationReport {
    pub task_id: TaskId,
    /// Original payload of the first majority member; set only when passed.
    pub consensus_result: Option<String>,
    /// Largest group's payload whenever anything survived, passed or not.
    pub best_candidate: Option<String>,
    /// Exact `|majority| / |on-time|`, 0 when nothing survived.
    pub confidence_score: f64,
    pub agents_queried: usize,
    pub agents_agreed: usize,
    pub sla_violators: Vec<Address>,
    pub passed: bool,
    pub failure: Option<ConsensusFailure>,
    pub outcomes: Vec<AgentOutcome>,
}

/// `agreed / surviving` rounded half up to a whole percent, against the
/// threshold rounded to a whole percent.
pub fn meets_threshold(agreed: usize, surviving: usize, min_fraction: f64) -> bool {
    if surviving == 0 {
        return false;
    }
    let agreed = agreed as u64;
    let surviving = surviving as u64;
    let percent = (agreed * 200 + surviving) / (2 * surviving);
    let required = (min_fraction * 100.0).round().max(0.0) as u64;
    percent >= required
}

/// Decide a pass from the SLA-partitioned results.
///
/// `min_agreeing` is raised to [`MIN_AGREEING_RESULTS`] if given lower, so a
/// single unmatched answer never passes.
pub fn evaluate(
    task_id: TaskId,
    agents_queried: usize,
    partition: &SlaPartition,
    sla: &Sla,
    min_agreeing: usize,
) -> VerificationReport {
    let min_agreeing = min_agreeing.max(MIN_AGREEING_RESULTS);
    let tally: Tally = partition.on_time.iter().collect();
    let surviving = tally.total();
    let majority = tally.majority();

    let agents_agreed = majority.map(|g| g.count).unwrap_or(0);
    let confidence_score = if surviving == 0 {
        0.0
    } else {
        agents_agreed as f64 / surviving as f64
    };

    let failure = if surviving == 0 {
        Some(if agents_queried == 0 {
            ConsensusFailure::NoAgents
        } else if partition.late.is_empty() {
            ConsensusFailure::NoResponses
        } else {
            ConsensusFailure::AllLate
        })
    } else if !meets_threshold(agents_agreed, surviving, sla.min_consensus_fraction) {
        Some(ConsensusFailure::BelowThreshold)
    } else if agents_agreed < min_agreeing {
        Some(ConsensusFailure::TooFewAgreeing)
    } else {
        None
    };
    let passed = failure.is_none();

    let winning_key = if passed { majority.map(|g| g.key.as_str()) } else { None };
    let agreed_with = |t: &TimedResult| winning_key == Some(normalize(&t.result.payload).as_str());

    let mut outcomes = Vec::new();
    let mut seen = HashSet::new();
    for t in &partition.on_time {
        if seen.insert(t.result.agent) {
            outcomes.push(AgentOutcome {
                agent: t.result.agent,
                success: agreed_with(t),
                sla_violation: false,
                response_time_ms: Some(t.response_time_ms),
            });
        }
    }
    for t in &partition.late {
        if seen.insert(t.result.agent) {
            outcomes.push(AgentOutcome {
                agent: t.result.agent,
                success: agreed_with(t),
                sla_violation: true,
                response_time_ms: Some(t.response_time_ms),
            });
        }
    }
    for f in &partition.failed {
        match f.agent {
            Some(agent) if seen.insert(agent) => outcomes.push(AgentOutcome {
                agent,
                success: false,
                sla_violation: false,
                response_time_ms: None,
            }),
            Some(_) => {}
            None => tracing::debug!(
                task = %task_id,
                endpoint = %f.endpoint,
                reason = %f.reason,
                "Failure not attributable to a registered agent"
            ),
        }
    }

    let report = VerificationReport {
        task_id,
        consensus_result: if passed {
            majority.map(|g| g.representative.clone())
        } else {
            None
        },
        best_candidate: majority.map(|g| g.representative.clone()),
        confidence_score,
        agents_queried,
        agents_agreed,
        sla_violators: partition.violators(),
        passed,
        failure,
        outcomes,
    };

    tracing::info!(
        task = %task_id,
        passed = report.passed,
        confidence = report.confidence_score,
        agreed = report.agents_agreed,
        surviving,
        queried = report.agents_queried,
        late = report.sla_violators.len(),
        "Consensus evaluated"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::identity::VerifiedResult;
    use crate::verification::{FailedResult, FailureReason};

    const TASK: TaskId = TaskId([5; 32]);

    fn timed(arrival: usize, agent: u8, payload: &str) -> TimedResult {
        TimedResult {
            result: VerifiedResult {
                endpoint: format!("http://agent-{}", agent),
                arrival,
                agent: Address([agent; 32]),
                payload: payload.into(),
                timestamp_ms: 0,
            },
            response_time_ms: 100,
        }
    }

    fn on_time(payloads: &[&str]) -> SlaPartition {
        SlaPartition {
            on_time: payloads
                .iter()
                .enumerate()
                .map(|(i, p)| timed(i, i as u8 + 1, p))
                .collect(),
            ..SlaPartition::default()
        }
    }

    fn run(partition: &SlaPartition, queried: usize) -> VerificationReport {
        evaluate(TASK, queried, partition, &Sla::default(), 2)
    }

    #[test]
    fn two_of_three_passes_at_default_threshold() {
        let p = on_time(&["Brazil 3 - 0 Germany", "brazil 3 - 0 germany  ", "Germany wins"]);
        let r = run(&p, 3);
        assert!(r.passed);
        assert_eq!(r.consensus_result.as_deref(), Some("Brazil 3 - 0 Germany"));
        assert_eq!(r.agents_agreed, 2);
        assert!((r.confidence_score - 2.0 / 3.0).abs() < 1e-9);
        let dissenter = r.outcomes.iter().find(|o| o.agent == Address([3; 32])).unwrap();
        assert!(!dissenter.success);
        assert_eq!(r.outcomes.iter().filter(|o| o.success).count(), 2);
    }

    #[test]
    fn all_distinct_fails() {
        let r = run(&on_time(&["a", "b", "c"]), 3);
        assert!(!r.passed);
        assert_eq!(r.consensus_result, None);
        assert_eq!(r.best_candidate.as_deref(), Some("a"));
        assert_eq!(r.failure, Some(ConsensusFailure::BelowThreshold));
        assert!(r.outcomes.iter().all(|o| !o.success));
    }

    #[test]
    fn single_survivor_is_too_few() {
        let r = run(&on_time(&["a"]), 3);
        assert!(!r.passed);
        assert_eq!(r.confidence_score, 1.0);
        assert_eq!(r.failure, Some(ConsensusFailure::TooFewAgreeing));
    }

    #[test]
    fn tie_goes_to_first_seen_group() {
        let p = SlaPartition {
            on_time: vec![timed(3, 1, "B"), timed(0, 2, "a"), timed(1, 3, "b"), timed(2, 4, "A")],
            ..SlaPartition::default()
        };
        let tally: Tally = p.on_time.iter().collect();
        let majority = tally.majority().unwrap();
        assert_eq!(majority.key, "a");
        assert_eq!(majority.representative, "a");
        assert_eq!(majority.count, 2);
    }

    #[test]
    fn tally_merge_is_order_independent() {
        let items = [timed(0, 1, "x"), timed(1, 2, "Y"), timed(2, 3, "X "), timed(3, 4, "y")];
        let forward: Tally = items.iter().collect();
        let backward: Tally = items.iter().rev().collect();
        assert_eq!(forward, backward);
        assert_eq!(forward.majority().unwrap().representative, "x");
    }

    #[test]
    fn empty_inputs_are_classified() {
        let none = run(&SlaPartition::default(), 0);
        assert_eq!(none.failure, Some(ConsensusFailure::NoAgents));
        assert_eq!(none.best_candidate, None);
        assert_eq!(none.confidence_score, 0.0);

        let failed = SlaPartition {
            failed: vec![FailedResult {
                endpoint: "e".into(),
                arrival: 0,
                reason: FailureReason::Timeout,
                agent: Some(Address([9; 32])),
            }],
            ..SlaPartition::default()
        };
        let r = run(&failed, 1);
        assert_eq!(r.failure, Some(ConsensusFailure::NoResponses));
        assert_eq!(r.outcomes.len(), 1);
        assert!(!r.outcomes[0].success);

        let late = SlaPartition {
            late: vec![timed(0, 1, "x")],
            ..SlaPartition::default()
        };
        let r = run(&late, 1);
        assert_eq!(r.failure, Some(ConsensusFailure::AllLate));
        assert_eq!(r.sla_violators, vec![Address([1; 32])]);
        assert!(r.outcomes[0].sla_violation);
    }

    #[test]
    fn late_agent_is_excluded_from_vote_but_rewarded_if_correct() {
        let mut p = on_time(&["42", "42"]);
        p.late.push(timed(2, 9, "42"));
        let r = run(&p, 3);
        assert!(r.passed);
        assert_eq!(r.agents_agreed, 2);
        assert_eq!(r.confidence_score, 1.0);
        let late = r.outcomes.iter().find(|o| o.agent == Address([9; 32])).unwrap();
        assert!(late.success);
        assert!(late.sla_violation);
    }

    #[test]
    fn agent_appears_once_in_outcomes() {
        let mut p = on_time(&["42", "42"]);
        p.failed.push(FailedResult {
            endpoint: "second-endpoint".into(),
            arrival: 2,
            reason: FailureReason::Timeout,
            agent: Some(Address([1; 32])),
        });
        let r = run(&p, 3);
        assert_eq!(r.outcomes.len(), 2);
        assert!(r.outcomes.iter().all(|o| o.success));
    }

    #[test]
    fn lone_answer_never_passes_even_with_low_settings() {
        let sla = Sla {
            max_response_time_ms: 1_000,
            min_consensus_fraction: 0.5,
        };
        let r = evaluate(TASK, 2, &on_time(&["a", "b"]), &sla, 1);
        assert!(!r.passed);
        assert_eq!(r.failure, Some(ConsensusFailure::TooFewAgreeing));
        assert_eq!(r.consensus_result, None);
    }

    #[test]
    fn threshold_uses_whole_percent() {
        assert!(meets_threshold(2, 3, 0.67));
        assert!(!meets_threshold(1, 2, 0.67));
        assert!(meets_threshold(1, 2, 0.5));
        assert!(!meets_threshold(3, 5, 0.61));
        assert!(meets_threshold(3, 3, 1.0));
        assert!(!meets_threshold(0, 0, 0.1));
    }
}
