//! Signature and identity checks on collected answers.
//!
//! An answer survives only if its claimed address parses, its signature
//! verifies for that address over [`result_sign_data`], it does not
//! contradict the registered owner of the endpoint that produced it, the
//! signer is still eligible to vote, and no earlier answer in the same pass
//! already came from that address.
//! Everything else is downgraded to the failure sentinel.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::collector::ClaimedResult;
use super::{AgentResult, FailedResult, FailureReason};
use crate::crypto::keys::{Address, Signature};
use crate::crypto::{result_sign_data, SignatureVerifier};
use crate::TaskId;

/// Why an answer failed its identity check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum IdentityFailure {
    #[error("malformed agent address")]
    MalformedAddress,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature does not verify for the claimed address")]
    BadSignature,
    #[error("endpoint is registered to {expected}")]
    EndpointMismatch { expected: Address },
    #[error("agent is not active")]
    InactiveAgent,
    #[error("agent already answered in this pass")]
    DuplicateAgent,
}

/// An answer whose author is proven.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedResult {
    pub endpoint: String,
    pub arrival: usize,
    pub agent: Address,
    pub payload: String,
    /// Later of the agent-claimed and locally observed completion time, so
    /// an agent cannot shave latency by under-reporting its timestamp.
    pub timestamp_ms: u64,
}

/// Check every collected answer.
///
/// `endpoint_owners` maps endpoints to the agent registered for them; it is
/// used both to reject impersonation and to attribute failures.
pub fn verify_identities<V: SignatureVerifier + ?Sized>(
    task_id: &TaskId,
    results: Vec<AgentResult<ClaimedResult>>,
    verifier: &V,
    endpoint_owners: &HashMap<String, Address>,
) -> Vec<AgentResult<VerifiedResult>> {
    let mut seen: HashSet<Address> = HashSet::new();
    let mut checked = Vec::with_capacity(results.len());

    for result in results {
        let claimed = match result {
            AgentResult::Ok(claimed) => claimed,
            AgentResult::Failed(mut failed) => {
                failed.agent = endpoint_owners.get(&failed.endpoint).copied();
                checked.push(AgentResult::Failed(failed));
                continue;
            }
        };

        let owner = endpoint_owners.get(&claimed.endpoint).copied();
        match check(task_id, &claimed, verifier, owner, &seen) {
            Ok(agent) => {
                seen.insert(agent);
                checked.push(AgentResult::Ok(VerifiedResult {
                    endpoint: claimed.endpoint,
                    arrival: claimed.arrival,
                    agent,
                    payload: claimed.response.result,
                    timestamp_ms: claimed.response.timestamp.max(claimed.received_at_ms),
                }));
            }
            Err(failure) => {
                tracing::warn!(
                    task = %task_id,
                    endpoint = %claimed.endpoint,
                    reason = %failure,
                    "Rejected agent result"
                );
                // Deactivated agents sit the pass out without a score change.
                let agent = match failure {
                    IdentityFailure::InactiveAgent => None,
                    _ => owner,
                };
                checked.push(AgentResult::Failed(FailedResult {
                    endpoint: claimed.endpoint,
                    arrival: claimed.arrival,
                    reason: FailureReason::Identity(failure),
                    agent,
                }));
            }
        }
    }

    checked
}

fn check<V: SignatureVerifier + ?Sized>(
    task_id: &TaskId,
    claimed: &ClaimedResult,
    verifier: &V,
    owner: Option<Address>,
    seen: &HashSet<Address>,
) -> Result<Address, IdentityFailure> {
    let agent = Address::from_hex(&claimed.response.agent_address)
        .ok_or(IdentityFailure::MalformedAddress)?;
    if let Some(expected) = owner {
        if expected != agent {
            return Err(IdentityFailure::EndpointMismatch { expected });
        }
    }
    let signature =
        Signature::from_hex(&claimed.response.signature).ok_or(IdentityFailure::MalformedSignature)?;
    let message = result_sign_data(task_id, &claimed.response.result);
    if !verifier.verify(&agent, &message, &signature) {
        return Err(IdentityFailure::BadSignature);
    }
    if !verifier.is_eligible(&agent) {
        return Err(IdentityFailure::InactiveAgent);
    }
    if seen.contains(&agent) {
        return Err(IdentityFailure::DuplicateAgent);
    }
    Ok(agent)
}
