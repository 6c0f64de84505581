//! Agent registry and reputation ledger.
//!
//! One record per agent address (the fingerprint of its signing key).
//! Registration is open, metadata updates are owner-gated and reputation
//! updates are orchestrator-gated. The registry also serves as the
//! [`SignatureVerifier`] for the verification pipeline, since it is the only
//! component that knows which public key stands behind an address.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{INITIAL_REPUTATION, MAX_METADATA_URI_LEN};
use crate::crypto::keys::{Address, Signature, SigningPublicKey};
use crate::crypto::SignatureVerifier;
use crate::reputation::{self, Outcome, ReputationChange};
use crate::store::{get_record, update_record, KvStore, StoreError, Tree};

/// Persisted registry entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub address: Address,
    pub owner: Address,
    pub public_key: SigningPublicKey,
    /// Base URL of the agent's `/predict` endpoint.
    pub metadata_uri: String,
    pub metadata_version: u32,
    pub is_active: bool,
    pub reputation_score: u32,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub sla_violation_count: u32,
    pub registered_at_ms: u64,
}

impl AgentRecord {
    pub fn new(
        owner: Address,
        public_key: SigningPublicKey,
        metadata_uri: String,
        registered_at_ms: u64,
    ) -> Self {
        AgentRecord {
            address: public_key.address(),
            owner,
            public_key,
            metadata_uri,
            metadata_version: 1,
            is_active: true,
            reputation_score: INITIAL_REPUTATION,
            total_tasks: 0,
            successful_tasks: 0,
            sla_violation_count: 0,
            registered_at_ms,
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent {0} is already registered")]
    AlreadyRegistered(Address),
    #[error("agent {0} is not registered")]
    AgentNotRegistered(Address),
    #[error("{0} is not allowed to perform this operation")]
    Unauthorized(Address),
    #[error("invalid metadata URI: {0}")]
    InvalidMetadataUri(String),
    #[error("endpoint {0} is already registered to another agent")]
    EndpointInUse(String),
    #[error("agent {0} was deactivated for SLA violations")]
    SlaSuspended(Address),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Canonical form of an endpoint URL for lookups.
pub fn normalize_endpoint(uri: &str) -> String {
    uri.trim().trim_end_matches('/').to_string()
}

fn validate_uri(uri: &str) -> Result<String, RegistryError> {
    let uri = normalize_endpoint(uri);
    if uri.len() > MAX_METADATA_URI_LEN {
        return Err(RegistryError::InvalidMetadataUri(format!(
            "longer than {} bytes",
            MAX_METADATA_URI_LEN
        )));
    }
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))
        .ok_or_else(|| RegistryError::InvalidMetadataUri(format!("{:?} is not http(s)", uri)))?;
    if rest.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidMetadataUri(format!("{:?} has no host", uri)));
    }
    Ok(uri)
}

pub struct AgentRegistry<S: KvStore> {
    store: Arc<S>,
    orchestrator: Address,
}

impl<S: KvStore> AgentRegistry<S> {
    /// `orchestrator` is the only identity allowed to record outcomes.
    pub fn new(store: Arc<S>, orchestrator: Address) -> Self {
        AgentRegistry {
            store,
            orchestrator,
        }
    }

    /// Register the agent identified by `public_key`, owned by `owner`.
    pub fn register_agent(
        &self,
        owner: Address,
        public_key: SigningPublicKey,
        metadata_uri: &str,
    ) -> Result<AgentRecord, RegistryError> {
        let uri = validate_uri(metadata_uri)?;
        let address = public_key.address();
        if self.agent_for_endpoint(&uri)?.is_some_and(|a| a != address) {
            return Err(RegistryError::EndpointInUse(uri));
        }

        let record = update_record(self.store.as_ref(), Tree::Agents, &address.0, |current| {
            match current {
                Some(_) => Err(RegistryError::AlreadyRegistered(address)),
                None => Ok(AgentRecord::new(
                    owner,
                    public_key.clone(),
                    uri.clone(),
                    crate::now_ms(),
                )),
            }
        })?;
        self.store.flush()?;

        tracing::info!(
            agent = %address.short(),
            owner = %owner.short(),
            endpoint = %record.metadata_uri,
            "Agent registered"
        );
        Ok(record)
    }

    /// Owner-only update of endpoint and activity flag.
    ///
    /// `metadata_uri: None` keeps the current endpoint. Reactivating an agent
    /// that was switched off by its SLA history is refused.
    pub fn update_metadata(
        &self,
        caller: Address,
        agent: Address,
        metadata_uri: Option<&str>,
        is_active: bool,
    ) -> Result<AgentRecord, RegistryError> {
        let uri = metadata_uri.map(validate_uri).transpose()?;
        if let Some(uri) = &uri {
            if self.agent_for_endpoint(uri)?.is_some_and(|a| a != agent) {
                return Err(RegistryError::EndpointInUse(uri.clone()));
            }
        }

        let record = update_record(self.store.as_ref(), Tree::Agents, &agent.0, |current| {
            let mut record: AgentRecord =
                current.ok_or(RegistryError::AgentNotRegistered(agent))?;
            if record.owner != caller {
                return Err(RegistryError::Unauthorized(caller));
            }
            if is_active && !record.is_active && reputation::is_sla_suspended(&record) {
                return Err(RegistryError::SlaSuspended(agent));
            }
            if let Some(uri) = &uri {
                record.metadata_uri = uri.clone();
            }
            record.is_active = is_active;
            record.metadata_version = record.metadata_version.saturating_add(1);
            Ok(record)
        })?;
        self.store.flush()?;

        tracing::info!(
            agent = %agent.short(),
            version = record.metadata_version,
            active = record.is_active,
            "Agent metadata updated"
        );
        Ok(record)
    }

    /// Apply one verification outcome to an agent's reputation.
    pub fn record_outcome(
        &self,
        caller: Address,
        agent: Address,
        success: bool,
        sla_violation: bool,
    ) -> Result<ReputationChange, RegistryError> {
        if caller != self.orchestrator {
            tracing::warn!(caller = %caller.short(), "Unauthorized reputation update");
            return Err(RegistryError::Unauthorized(caller));
        }

        let outcome = Outcome {
            success,
            sla_violation,
        };
        let mut change = None;
        update_record::<AgentRecord, RegistryError, _, _>(
            self.store.as_ref(),
            Tree::Agents,
            &agent.0,
            |current| {
                let mut record = current.ok_or(RegistryError::AgentNotRegistered(agent))?;
                change = Some(reputation::apply_outcome(&mut record, outcome));
                Ok(record)
            },
        )?;
        self.store.flush()?;
        let change = change.ok_or(RegistryError::AgentNotRegistered(agent))?;

        tracing::info!(
            agent = %agent.short(),
            success,
            sla_violation,
            score = change.score_after,
            delta = change.delta(),
            "Reputation updated"
        );
        if change.deactivated {
            tracing::warn!(agent = %agent.short(), "Agent deactivated after repeated SLA violations");
        }
        Ok(change)
    }

    pub fn get_agent(&self, agent: &Address) -> Result<Option<AgentRecord>, RegistryError> {
        Ok(get_record(self.store.as_ref(), Tree::Agents, &agent.0)?)
    }

    pub fn agent_count(&self) -> Result<usize, RegistryError> {
        Ok(self.store.len(Tree::Agents)?)
    }

    /// Every agent, oldest registration first.
    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        let mut agents = Vec::new();
        for (_, bytes) in self.store.scan(Tree::Agents)? {
            let record: AgentRecord = crate::deserialize(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            agents.push(record);
        }
        agents.sort_by(|a, b| {
            a.registered_at_ms
                .cmp(&b.registered_at_ms)
                .then(a.address.cmp(&b.address))
        });
        Ok(agents)
    }

    pub fn active_agents(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        Ok(self
            .list_agents()?
            .into_iter()
            .filter(|a| a.is_active)
            .collect())
    }

    /// Normalized endpoint → agent, for every registered agent.
    pub fn endpoint_index(&self) -> Result<HashMap<String, Address>, RegistryError> {
        let mut index = HashMap::new();
        for agent in self.list_agents()? {
            index.entry(agent.metadata_uri).or_insert(agent.address);
        }
        Ok(index)
    }

    pub fn agent_for_endpoint(&self, endpoint: &str) -> Result<Option<Address>, RegistryError> {
        Ok(self.endpoint_index()?.get(&normalize_endpoint(endpoint)).copied())
    }
}

impl<S: KvStore> SignatureVerifier for AgentRegistry<S> {
    fn verify(&self, address: &Address, message: &[u8], signature: &Signature) -> bool {
        match self.get_agent(address) {
            Ok(Some(record)) => record.public_key.verify(message, signature),
            Ok(None) => false,
            Err(e) => {
                tracing::error!(agent = %address.short(), error = %e, "Registry lookup failed");
                false
            }
        }
    }

    fn is_eligible(&self, address: &Address) -> bool {
        match self.get_agent(address) {
            Ok(Some(record)) => record.is_active,
            Ok(None) => false,
            Err(e) => {
                tracing::error!(agent = %address.short(), error = %e, "Registry lookup failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MAX_REPUTATION, SLA_DEACTIVATION_THRESHOLD};
    use crate::crypto::keys::SigningKeypair;
    use crate::store::MemoryStore;

    const ORCH: Address = Address([0xAA; 32]);

    fn registry() -> AgentRegistry<MemoryStore> {
        AgentRegistry::new(Arc::new(MemoryStore::new()), ORCH)
    }

    fn register(reg: &AgentRegistry<MemoryStore>, uri: &str) -> SigningKeypair {
        let kp = SigningKeypair::generate();
        reg.register_agent(kp.address(), kp.public.clone(), uri).unwrap();
        kp
    }

    #[test]
    fn register_sets_initial_state() {
        let reg = registry();
        let kp = register(&reg, "http://agent-1:8080/");
        let record = reg.get_agent(&kp.address()).unwrap().unwrap();
        assert_eq!(record.metadata_uri, "http://agent-1:8080");
        assert_eq!(record.reputation_score, INITIAL_REPUTATION);
        assert_eq!(record.metadata_version, 1);
        assert!(record.is_active);
        assert_eq!(reg.agent_count().unwrap(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reg = registry();
        let kp = register(&reg, "http://a");
        assert!(matches!(
            reg.register_agent(kp.address(), kp.public.clone(), "http://a"),
            Err(RegistryError::AlreadyRegistered(_))
        ));
        let other = SigningKeypair::generate();
        assert!(matches!(
            reg.register_agent(other.address(), other.public.clone(), "http://a/"),
            Err(RegistryError::EndpointInUse(_))
        ));
        assert_eq!(reg.agent_count().unwrap(), 1);
    }

    #[test]
    fn metadata_uri_is_validated() {
        let reg = registry();
        let kp = SigningKeypair::generate();
        for bad in ["ftp://x", "agent:8080", "http://", "http://a b"] {
            assert!(
                matches!(
                    reg.register_agent(kp.address(), kp.public.clone(), bad),
                    Err(RegistryError::InvalidMetadataUri(_))
                ),
                "{} should be rejected",
                bad
            );
        }
        let long = format!("https://{}", "a".repeat(MAX_METADATA_URI_LEN));
        assert!(reg.register_agent(kp.address(), kp.public.clone(), &long).is_err());
    }

    #[test]
    fn only_owner_updates_metadata() {
        let reg = registry();
        let kp = register(&reg, "http://a");
        let stranger = Address([7; 32]);
        assert!(matches!(
            reg.update_metadata(stranger, kp.address(), Some("http://b"), true),
            Err(RegistryError::Unauthorized(_))
        ));

        let updated = reg
            .update_metadata(kp.address(), kp.address(), Some("http://b"), false)
            .unwrap();
        assert_eq!(updated.metadata_uri, "http://b");
        assert_eq!(updated.metadata_version, 2);
        assert!(!updated.is_active);

        let updated = reg.update_metadata(kp.address(), kp.address(), None, true).unwrap();
        assert_eq!(updated.metadata_uri, "http://b");
        assert_eq!(updated.metadata_version, 3);
        assert!(updated.is_active);
    }

    #[test]
    fn record_outcome_requires_orchestrator_and_registration() {
        let reg = registry();
        let kp = register(&reg, "http://a");
        assert!(matches!(
            reg.record_outcome(kp.address(), kp.address(), true, false),
            Err(RegistryError::Unauthorized(_))
        ));
        assert!(matches!(
            reg.record_outcome(ORCH, Address([3; 32]), true, false),
            Err(RegistryError::AgentNotRegistered(_))
        ));
        let change = reg.record_outcome(ORCH, kp.address(), true, false).unwrap();
        assert_eq!(change.score_after, INITIAL_REPUTATION + 10);
        let record = reg.get_agent(&kp.address()).unwrap().unwrap();
        assert_eq!(record.total_tasks, 1);
        assert_eq!(record.successful_tasks, 1);
    }

    #[test]
    fn sla_deactivation_cannot_be_undone_by_owner() {
        let reg = registry();
        let kp = register(&reg, "http://a");
        for _ in 0..SLA_DEACTIVATION_THRESHOLD {
            reg.record_outcome(ORCH, kp.address(), true, true).unwrap();
        }
        let record = reg.get_agent(&kp.address()).unwrap().unwrap();
        assert!(!record.is_active);
        assert!(record.reputation_score <= MAX_REPUTATION);

        assert!(matches!(
            reg.update_metadata(kp.address(), kp.address(), None, true),
            Err(RegistryError::SlaSuspended(_))
        ));
        // Staying inactive is still allowed
        reg.update_metadata(kp.address(), kp.address(), Some("http://c"), false)
            .unwrap();
        assert!(reg.active_agents().unwrap().is_empty());
    }

    #[test]
    fn discovery_lists_only_active_agents() {
        let reg = registry();
        let a = register(&reg, "http://a");
        let b = register(&reg, "http://b");
        reg.update_metadata(b.address(), b.address(), None, false).unwrap();
        let c = register(&reg, "http://c");

        let all: Vec<_> = reg.list_agents().unwrap().iter().map(|r| r.address).collect();
        assert_eq!(all.len(), 3);
        let active: Vec<_> = reg.active_agents().unwrap().iter().map(|r| r.address).collect();
        assert!(active.contains(&a.address()));
        assert!(active.contains(&c.address()));
        assert!(!active.contains(&b.address()));

        assert_eq!(reg.agent_for_endpoint("http://b/").unwrap(), Some(b.address()));
        assert_eq!(reg.agent_for_endpoint("http://zzz").unwrap(), None);
    }

    #[test]
    fn registry_verifies_registered_keys_only() {
        let reg = registry();
        let kp = register(&reg, "http://a");
        let stranger = SigningKeypair::generate();
        let sig = kp.sign(b"msg");
        assert!(reg.verify(&kp.address(), b"msg", &sig));
        assert!(!reg.verify(&kp.address(), b"other", &sig));
        assert!(!reg.verify(&stranger.address(), b"msg", &stranger.sign(b"msg")));
    }

    #[test]
    fn record_outcome_updates_counters() {
        let reg = registry();
        let kp = register(&reg, "http://a");
        let change = reg.record_outcome(ORCH, kp.address(), true, false).unwrap();
        assert_eq!(change.delta(), 10);
        let record = reg.get_agent(&kp.address()).unwrap().unwrap();
        assert_eq!(record.total_tasks, 1);
        assert_eq!(record.successful_tasks, 1);
    }

    #[test]
    fn inactive_agents_are_not_eligible() {
        let reg = registry();
        let kp = register(&reg, "http://a");
        assert!(reg.is_eligible(&kp.address()));
        reg.update_metadata(kp.address(), kp.address(), None, false).unwrap();
        assert!(!reg.is_eligible(&kp.address()));
        assert!(!reg.is_eligible(&SigningKeypair::generate().address()));
    }
}
