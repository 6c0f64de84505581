//! # Verification pipeline
//!
//! Turns the raw answers of redundant agents into one verdict:
//!
//! ```text
//!   collector ──► identity ──► sla ──► consensus ──► VerificationReport
//!   (dispatch)   (signature)  (latency) (majority)
//! ```
//!
//! Every stage is total: an answer that cannot be trusted (no response,
//! transport error, bad signature, impersonation) becomes a
//! [`AgentResult::Failed`] and keeps flowing, so downstream counting treats a
//! compromised agent exactly like an offline one. Only consensus decides, and
//! it decides on the full tally, never on a partial one.

pub mod collector;
pub mod consensus;
pub mod identity;
pub mod sla;

use serde::Serialize;

use crate::crypto::keys::Address;

/// Payload shown in place of an untrusted answer.
pub const FAILURE_SENTINEL: &str = "FAILED";

/// One agent's answer at some stage of the pipeline.
#[derive(Clone, Debug)]
pub enum AgentResult<T> {
    Ok(T),
    Failed(FailedResult),
}

impl<T> AgentResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, AgentResult::Ok(_))
    }
}

/// A dispatch that produced nothing trustworthy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedResult {
    pub endpoint: String,
    /// Position in arrival order.
    pub arrival: usize,
    pub reason: FailureReason,
    /// Registered owner of the endpoint, when known. Never taken from the
    /// response itself, so a forged answer cannot get a third party penalized.
    pub agent: Option<Address>,
}

/// Why a result was replaced by the failure sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("dispatch task aborted: {0}")]
    Aborted(String),
    #[error("identity check failed: {0}")]
    Identity(identity::IdentityFailure),
}
