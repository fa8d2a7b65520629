// Contract registry.
//
// Persists the {identity type -> deployed contract} mapping for the lifetime
// of the owning process. Exactly one process owns each identity type; the
// registry enforces the single-record invariant inside that process.
//
// INVARIANTS:
// 1. At most one ContractRecord per identity type.
// 2. A record whose on-chain code no longer matches its recorded hash is
//    invalidated and replaced by a fresh deployment, never patched in place.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers_core::types::{Address, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Registry entry for one identity type's deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub identity_type: String,

    /// On-chain address of the deployed contract.
    pub address: Address,

    /// Serialized interface definition, as recorded at deployment time.
    pub abi: String,

    /// keccak256 of the bytecode deployed at `address`. Compared against
    /// the live chain to detect drift.
    pub code_hash: H256,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("identity type '{identity_type}' already has a live contract at {existing:#x}")]
    Conflict {
        identity_type: String,
        existing: Address,
    },
}

/// Process-lifetime registry of deployed contracts, one record per identity
/// type. Created at process start and passed explicitly to every component
/// that resolves contracts; there is no ambient global.
pub struct ContractRegistry {
    records: DashMap<String, ContractRecord>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        ContractRegistry {
            records: DashMap::new(),
        }
    }

    /// Look up the record for an identity type.
    pub fn resolve(&self, identity_type: &str) -> Option<ContractRecord> {
        self.records
            .get(identity_type)
            .map(|entry| entry.value().clone())
    }

    /// Record a freshly deployed contract. Fails if another writer already
    /// recorded a different contract for the same identity type; re-saving
    /// the identical record is a no-op.
    pub fn save(&self, record: ContractRecord) -> Result<(), RegistryError> {
        match self.records.entry(record.identity_type.clone()) {
            Entry::Vacant(slot) => {
                info!(
                    identity_type = %record.identity_type,
                    address = %format!("{:#x}", record.address),
                    "contract record saved"
                );
                slot.insert(record);
                Ok(())
            }
            Entry::Occupied(existing) if existing.get().address == record.address => Ok(()),
            Entry::Occupied(existing) => Err(RegistryError::Conflict {
                identity_type: record.identity_type,
                existing: existing.get().address,
            }),
        }
    }

    /// Remove a record whose on-chain code no longer matches. The caller is
    /// expected to follow up with a `save` from a new deployment. Returns
    /// false if the registry held a different record than the one given.
    pub fn invalidate(&self, record: &ContractRecord) -> bool {
        self.records
            .remove_if(&record.identity_type, |_, current| {
                current.address == record.address
            })
            .is_some()
    }

    pub fn identity_types(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        ContractRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity_type: &str, byte: u8) -> ContractRecord {
        ContractRecord {
            identity_type: identity_type.into(),
            address: Address::repeat_byte(byte),
            abi: "[]".into(),
            code_hash: H256::repeat_byte(byte),
        }
    }

    #[test]
    fn save_then_resolve_round_trips() {
        let registry = ContractRegistry::new();
        let rec = record("Coinbase", 0x01);
        registry.save(rec.clone()).unwrap();
        assert_eq!(registry.resolve("Coinbase"), Some(rec));
        assert_eq!(registry.resolve("Twitter"), None);
    }

    #[test]
    fn double_write_for_same_type_conflicts() {
        let registry = ContractRegistry::new();
        registry.save(record("Coinbase", 0x01)).unwrap();
        match registry.save(record("Coinbase", 0x02)) {
            Err(RegistryError::Conflict { existing, .. }) => {
                assert_eq!(existing, Address::repeat_byte(0x01));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn resaving_the_identical_record_is_a_no_op() {
        let registry = ContractRegistry::new();
        registry.save(record("Coinbase", 0x01)).unwrap();
        registry.save(record("Coinbase", 0x01)).unwrap();
        assert_eq!(registry.identity_types(), vec!["Coinbase".to_string()]);
    }

    #[test]
    fn invalidate_removes_only_the_matching_record() {
        let registry = ContractRegistry::new();
        registry.save(record("Coinbase", 0x01)).unwrap();

        // A stale copy pointing at a different address must not remove the
        // live record.
        assert!(!registry.invalidate(&record("Coinbase", 0x02)));
        assert!(registry.resolve("Coinbase").is_some());

        assert!(registry.invalidate(&record("Coinbase", 0x01)));
        assert_eq!(registry.resolve("Coinbase"), None);

        // Invalidate then save from a new deployment is the legal sequence.
        registry.save(record("Coinbase", 0x03)).unwrap();
        assert_eq!(
            registry.resolve("Coinbase").unwrap().address,
            Address::repeat_byte(0x03)
        );
    }
}
