//! # Verity
//!
//! Redundant-agent task verification and settlement:
//! - **Dispatch**: the same task goes to several independent agents at once
//! - **Identity**: every answer must carry a Dilithium5 signature from a registered agent
//! - **SLA**: answers slower than the agreed latency never count toward the vote
//! - **Consensus**: majority agreement over normalized payloads with a confidence threshold
//! - **Settlement**: escrow released to the seller or refunded to the buyer, exactly once
//! - **Reputation**: bounded per-agent score with automatic SLA deactivation

pub mod config;
pub mod crypto;
pub mod orchestrator;
pub mod registry;
pub mod reputation;
pub mod rpc;
pub mod settlement;
pub mod store;
pub mod verification;
pub mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol constants
pub mod constants {
    /// Upper bound of an agent's reputation score.
    pub const MAX_REPUTATION: u32 = 1_000;
    /// Reputation assigned at registration.
    pub const INITIAL_REPUTATION: u32 = 500;
    /// Score added for an outcome that matched the accepted consensus.
    pub const SUCCESS_REWARD: u32 = 10;
    /// Score removed for a failed or dissenting outcome.
    pub const FAILURE_PENALTY: u32 = 50;
    /// Extra score removed whenever the agent breached the SLA.
    pub const SLA_PENALTY: u32 = 20;
    /// SLA violations after which an agent is deactivated for good.
    pub const SLA_DEACTIVATION_THRESHOLD: u32 = 5;

    /// Default maximum response latency for an answer to count (ms).
    pub const DEFAULT_MAX_RESPONSE_TIME_MS: u64 = 5_000;
    /// Default fraction of surviving answers that must agree.
    pub const DEFAULT_MIN_CONSENSUS_FRACTION: f64 = 0.67;
    /// Default hard per-call timeout when dispatching to an agent (ms).
    ///
    /// Longer than the SLA so late answers are still collected and recorded
    /// as violations instead of disappearing as transport failures.
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
    /// Minimum size of the majority group, regardless of the fraction.
    pub const MIN_AGREEING_RESULTS: usize = 2;

    /// Maximum accepted result payload (64 KiB).
    pub const MAX_RESULT_PAYLOAD_BYTES: usize = 65_536;
    /// Maximum agent response body read off the wire (128 KiB).
    pub const MAX_RESPONSE_BODY_BYTES: usize = 2 * MAX_RESULT_PAYLOAD_BYTES;
    /// Maximum length of an agent's metadata URI.
    pub const MAX_METADATA_URI_LEN: usize = 256;
    /// Maximum encoded size of a stored record (1 MiB).
    pub const MAX_RECORD_BYTES: usize = 1024 * 1024;
    /// Compare-and-swap attempts before a write gives up.
    pub const CAS_RETRY_LIMIT: usize = 32;

    /// Default RPC listen port.
    pub const DEFAULT_RPC_PORT: u16 = 9840;
    /// Capacity of the escrow event broadcast channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Opaque, fixed-length task identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub Hash);

impl TaskId {
    /// Parse a task id: 64 hex characters are taken verbatim, anything else
    /// is treated as a human label and hashed into a fixed-length id.
    pub fn parse(s: &str) -> TaskId {
        let s = s.trim();
        if s.len() == 64 {
            if let Ok(bytes) = hex::decode(s) {
                if let Ok(raw) = bytes.try_into() {
                    return TaskId(raw);
                }
            }
        }
        TaskId(hash_domain(b"verity.task_id", s.as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", &self.to_hex()[..16])
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let raw: Hash = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("task id must be 32 bytes"))?;
        Ok(TaskId(raw))
    }
}

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Verity domains are ASCII literals).
/// Panics if `domain` is not valid UTF-8.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Milliseconds since the UNIX epoch, saturating to 0 on a clock before 1970.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_RECORD_BYTES` so a corrupted store entry
/// cannot trigger a huge allocation.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_RECORD_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
