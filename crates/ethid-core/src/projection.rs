// Identity projection store.
//
// One record per (identity type, address, claim value) tuple in flight or
// resolved. Storage mechanics are behind the `IdentityStore` trait; the
// transition rules and the conditional-update contract live here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers_core::types::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of an identity record.
///
/// pending: claim observed on chain, awaiting a human approval request.
/// verifying: approval submitted to the contract, awaiting the confirming
/// event. verified: the contract recorded the claim as verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterState {
    Pending,
    Verifying,
    Verified,
}

impl RegisterState {
    /// Legal forward edges of the lifecycle. Removal is not a transition;
    /// records leave the store through `remove`.
    pub fn can_transition(self, to: RegisterState) -> bool {
        matches!(
            (self, to),
            (RegisterState::Pending, RegisterState::Verifying)
                | (RegisterState::Verifying, RegisterState::Verified)
        )
    }
}

impl std::fmt::Display for RegisterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegisterState::Pending => "pending",
            RegisterState::Verifying => "verifying",
            RegisterState::Verified => "verified",
        };
        f.write_str(name)
    }
}

/// Primary key of an identity record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub identity_type: String,
    pub address: Address,
    pub claim: String,
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{:#x}/'{}'",
            self.identity_type, self.address, self.claim
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity_type: String,
    pub address: Address,
    pub claim: String,
    pub state: RegisterState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            identity_type: self.identity_type.clone(),
            address: self.address,
            claim: self.claim.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("identity {key} is not in state {expected}, found {found}")]
    StaleState {
        key: IdentityKey,
        expected: RegisterState,
        found: RegisterState,
    },

    #[error("no transition from {from} to {to}")]
    IllegalTransition {
        from: RegisterState,
        to: RegisterState,
    },

    #[error("identity {0} not found")]
    NotFound(IdentityKey),

    #[error("identity {0} already exists")]
    AlreadyExists(IdentityKey),
}

/// Read/write contract of the projection datastore.
///
/// `transition` is a conditional update: it succeeds only when the record is
/// still in the expected `from` state, so a concurrent automated
/// reconciliation and a concurrent human approval cannot both move the same
/// record. The loser observes `StaleState` and must re-read.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find(&self, key: &IdentityKey) -> Option<IdentityRecord>;

    async fn find_by_address(&self, identity_type: &str, address: Address) -> Vec<IdentityRecord>;

    async fn find_by_claim(&self, claim: &str) -> Vec<IdentityRecord>;

    async fn find_by_claim_and_state(
        &self,
        claim: &str,
        state: RegisterState,
    ) -> Vec<IdentityRecord>;

    /// Create a new record in `pending` state.
    async fn create(&self, key: IdentityKey) -> Result<IdentityRecord, ProjectionError>;

    /// Compare-and-swap on `state`.
    async fn transition(
        &self,
        key: &IdentityKey,
        from: RegisterState,
        to: RegisterState,
    ) -> Result<IdentityRecord, ProjectionError>;

    async fn remove(&self, key: &IdentityKey) -> Result<IdentityRecord, ProjectionError>;
}

/// In-process projection store backed by a concurrent map. The per-entry
/// shard lock makes `transition`'s read-check-write atomic with respect to
/// other writers.
pub struct MemoryIdentityStore {
    records: DashMap<IdentityKey, IdentityRecord>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        MemoryIdentityStore {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn collect<F>(&self, predicate: F) -> Vec<IdentityRecord>
    where
        F: Fn(&IdentityRecord) -> bool,
    {
        self.records
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        MemoryIdentityStore::new()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find(&self, key: &IdentityKey) -> Option<IdentityRecord> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    async fn find_by_address(&self, identity_type: &str, address: Address) -> Vec<IdentityRecord> {
        self.collect(|record| record.identity_type == identity_type && record.address == address)
    }

    async fn find_by_claim(&self, claim: &str) -> Vec<IdentityRecord> {
        self.collect(|record| record.claim == claim)
    }

    async fn find_by_claim_and_state(
        &self,
        claim: &str,
        state: RegisterState,
    ) -> Vec<IdentityRecord> {
        self.collect(|record| record.claim == claim && record.state == state)
    }

    async fn create(&self, key: IdentityKey) -> Result<IdentityRecord, ProjectionError> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(key.clone()) {
            Entry::Occupied(_) => Err(ProjectionError::AlreadyExists(key)),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let record = IdentityRecord {
                    identity_type: key.identity_type,
                    address: key.address,
                    claim: key.claim,
                    state: RegisterState::Pending,
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn transition(
        &self,
        key: &IdentityKey,
        from: RegisterState,
        to: RegisterState,
    ) -> Result<IdentityRecord, ProjectionError> {
        if !from.can_transition(to) {
            return Err(ProjectionError::IllegalTransition { from, to });
        }
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| ProjectionError::NotFound(key.clone()))?;
        if entry.state != from {
            return Err(ProjectionError::StaleState {
                key: key.clone(),
                expected: from,
                found: entry.state,
            });
        }
        entry.state = to;
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }

    async fn remove(&self, key: &IdentityKey) -> Result<IdentityRecord, ProjectionError> {
        self.records
            .remove(key)
            .map(|(_, record)| record)
            .ok_or_else(|| ProjectionError::NotFound(key.clone()))
    }
}
