// Contract manager.
//
// Composes the registry, deployment controller, reconciler, and projection
// store for one identity type, and exposes the approve/reject workflow the
// web layer calls into. One manager per identity type per process.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers_core::abi::Token;
use ethers_core::types::Address;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use ethid_chain::{BlockRef, ChainClient, ChainError, ContractHandle};

use crate::deploy::{AttachmentState, DeployError, DeploymentController};
use crate::projection::{
    IdentityKey, IdentityRecord, IdentityStore, ProjectionError, RegisterState,
};
use crate::reconciler::{ClaimFormat, EventReconciler};
use crate::registry::ContractRegistry;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Operation requested before deployment completed. Until the chain
    /// confirms the contract, everything that depends on it fails with this.
    #[error("identity type '{0}' has no attached contract")]
    NotAttached(String),

    #[error("identity {key} is {found}; only pending or verifying claims can be rejected")]
    NotRejectable {
        key: IdentityKey,
        found: RegisterState,
    },

    #[error("a manager for identity type '{0}' is already registered")]
    DuplicateManager(String),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Deploy(#[from] DeployError),
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub identity_type: String,
    pub claim_format: ClaimFormat,

    /// Contract source text compiled at attach time.
    pub contract_source: String,

    pub gas_limit: u64,

    /// Replay events from this block on subscription. Redelivered events are
    /// harmless; every reconciliation rule is idempotent.
    pub resume_from: Option<BlockRef>,
}

/// Lifecycle owner for one identity type's contract and its projection.
pub struct ContractManager {
    config: ManagerConfig,
    controller: DeploymentController,
    reconciler: Arc<EventReconciler>,
    store: Arc<dyn IdentityStore>,
    contract: RwLock<Option<Arc<dyn ContractHandle>>>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl ContractManager {
    pub fn new(
        config: ManagerConfig,
        chain: Arc<dyn ChainClient>,
        registry: Arc<ContractRegistry>,
        store: Arc<dyn IdentityStore>,
    ) -> Arc<Self> {
        let controller = DeploymentController::new(
            config.identity_type.clone(),
            chain,
            registry,
            config.gas_limit,
        );
        let reconciler = Arc::new(EventReconciler::new(
            config.identity_type.clone(),
            config.claim_format,
            Arc::clone(&store),
        ));
        Arc::new(ContractManager {
            config,
            controller,
            reconciler,
            store,
            contract: RwLock::new(None),
            reconcile_task: Mutex::new(None),
        })
    }

    pub fn identity_type(&self) -> &str {
        &self.config.identity_type
    }

    /// Observe attachment progress without blocking on it.
    pub fn attachment(&self) -> watch::Receiver<AttachmentState> {
        self.controller.state()
    }

    /// Attach to the identity type's contract and start reconciling its
    /// events. Returns once the contract is confirmed and subscribed; a
    /// compile or deploy failure aborts attachment and surfaces here.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let contract = self
            .controller
            .attach(&self.config.contract_source)
            .await?;
        let events = contract.subscribe(self.config.resume_from);
        *self.contract.write() = Some(contract);

        let task = tokio::spawn(Arc::clone(&self.reconciler).run(events));
        *self.reconcile_task.lock() = Some(task);
        info!(identity_type = %self.config.identity_type, "contract manager started");
        Ok(())
    }

    /// Stop the reconcile loop. In-flight chain transactions are not
    /// cancellable and run to completion on the node regardless.
    pub fn shutdown(&self) {
        if let Some(task) = self.reconcile_task.lock().take() {
            task.abort();
        }
        *self.contract.write() = None;
    }

    fn contract(&self) -> Result<Arc<dyn ContractHandle>, ManagerError> {
        self.contract
            .read()
            .clone()
            .ok_or_else(|| ManagerError::NotAttached(self.config.identity_type.clone()))
    }

    /// Human-approved verification of a pending claim.
    ///
    /// Marks the record `verifying` (conditionally, so a racing automated
    /// transition cannot also win) and submits the verification transaction.
    /// Submission success means "accepted for processing", never "verified";
    /// the eventual `ClaimVerified` event closes the loop.
    pub async fn approve(&self, address: Address, claim: &str) -> Result<(), ManagerError> {
        let contract = self.contract()?;
        let key = self.key(address, claim);

        self.store
            .transition(&key, RegisterState::Pending, RegisterState::Verifying)
            .await?;

        let tx_hash = contract
            .send(
                "_setVerifiedIdentity",
                vec![Token::Address(address), Token::String(claim.to_string())],
            )
            .await?;
        info!(
            key = %key,
            tx_hash = %format!("{:#x}", tx_hash),
            "verification submitted"
        );
        Ok(())
    }

    /// Explicit rejection of an unverified claim; removes the record. A
    /// verified claim leaves the projection only through an on-chain
    /// `Unclaimed` event.
    pub async fn reject(
        &self,
        address: Address,
        claim: &str,
    ) -> Result<IdentityRecord, ManagerError> {
        let key = self.key(address, claim);
        let record = self
            .store
            .find(&key)
            .await
            .ok_or(ProjectionError::NotFound(key.clone()))?;
        if record.state == RegisterState::Verified {
            return Err(ManagerError::NotRejectable {
                key,
                found: record.state,
            });
        }
        let removed = self.store.remove(&key).await?;
        info!(key = %key, "claim rejected");
        Ok(removed)
    }

    /// Claims awaiting human approval for a given claim value; feeds the
    /// approval UI.
    pub async fn pending_for_claim(&self, claim: &str) -> Vec<IdentityRecord> {
        self.store
            .find_by_claim_and_state(claim, RegisterState::Pending)
            .await
    }

    fn key(&self, address: Address, claim: &str) -> IdentityKey {
        IdentityKey {
            identity_type: self.config.identity_type.clone(),
            address,
            claim: claim.to_string(),
        }
    }
}

/// Process-wide lookup of managers by identity type. Created at startup and
/// passed to whatever needs per-type dispatch; refuses duplicate
/// registration so each identity type has a single owner.
pub struct ManagerRegistry {
    managers: DashMap<String, Arc<ContractManager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        ManagerRegistry {
            managers: DashMap::new(),
        }
    }

    pub fn register(&self, manager: Arc<ContractManager>) -> Result<(), ManagerError> {
        match self.managers.entry(manager.identity_type().to_string()) {
            Entry::Occupied(existing) => Err(ManagerError::DuplicateManager(
                existing.key().clone(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(manager);
                Ok(())
            }
        }
    }

    pub fn get(&self, identity_type: &str) -> Option<Arc<ContractManager>> {
        self.managers
            .get(identity_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn identity_types(&self) -> Vec<String> {
        self.managers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        ManagerRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::MemoryIdentityStore;
    use ethid_chain::sim::SimChain;

    const SOURCE: &str = "contract EthID { mapping(address => string) identities; }";

    struct Fixture {
        chain: SimChain,
        manager: Arc<ContractManager>,
        store: Arc<MemoryIdentityStore>,
    }

    fn fixture() -> Fixture {
        let chain = SimChain::new();
        let store = Arc::new(MemoryIdentityStore::new());
        let manager = ContractManager::new(
            ManagerConfig {
                identity_type: "Coinbase".into(),
                claim_format: ClaimFormat::Email,
                contract_source: SOURCE.into(),
                gas_limit: 1_000_000,
                resume_from: None,
            },
            Arc::new(chain.clone()),
            Arc::new(ContractRegistry::new()),
            Arc::clone(&store) as Arc<dyn IdentityStore>,
        );
        Fixture {
            chain,
            manager,
            store,
        }
    }

    #[tokio::test]
    async fn approve_before_attachment_fails_not_attached() {
        let fx = fixture();
        let err = fx
            .manager
            .approve(Address::repeat_byte(0x01), "a@b.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotAttached(_)));
    }

    #[tokio::test]
    async fn approve_requires_a_pending_record() {
        let fx = fixture();
        fx.manager.start().await.unwrap();

        let err = fx
            .manager
            .approve(Address::repeat_byte(0x01), "a@b.com")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Projection(ProjectionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn approve_marks_verifying_and_submits_the_transaction() {
        let fx = fixture();
        fx.manager.start().await.unwrap();
        let addr = Address::repeat_byte(0x01);
        let key = IdentityKey {
            identity_type: "Coinbase".into(),
            address: addr,
            claim: "a@b.com".into(),
        };
        fx.store.create(key.clone()).await.unwrap();

        fx.manager.approve(addr, "a@b.com").await.unwrap();

        // Submission leaves the record verifying; only the confirming event
        // may move it to verified.
        let state = fx.store.find(&key).await.unwrap().state;
        assert!(matches!(
            state,
            RegisterState::Verifying | RegisterState::Verified
        ));
        let _ = &fx.chain;
    }

    #[tokio::test]
    async fn reject_removes_an_unverified_claim_only() {
        let fx = fixture();
        fx.manager.start().await.unwrap();
        let addr = Address::repeat_byte(0x01);
        let key = IdentityKey {
            identity_type: "Coinbase".into(),
            address: addr,
            claim: "a@b.com".into(),
        };

        // Nothing to reject yet.
        assert!(matches!(
            fx.manager.reject(addr, "a@b.com").await,
            Err(ManagerError::Projection(ProjectionError::NotFound(_)))
        ));

        fx.store.create(key.clone()).await.unwrap();
        fx.manager.reject(addr, "a@b.com").await.unwrap();
        assert!(fx.store.find(&key).await.is_none());

        // A verified record is not rejectable.
        fx.store.create(key.clone()).await.unwrap();
        fx.store
            .transition(&key, RegisterState::Pending, RegisterState::Verifying)
            .await
            .unwrap();
        fx.store
            .transition(&key, RegisterState::Verifying, RegisterState::Verified)
            .await
            .unwrap();
        assert!(matches!(
            fx.manager.reject(addr, "a@b.com").await,
            Err(ManagerError::NotRejectable { .. })
        ));
    }

    #[tokio::test]
    async fn pending_for_claim_lists_only_pending_records() {
        let fx = fixture();
        fx.manager.start().await.unwrap();
        for byte in [0x01, 0x02] {
            fx.store
                .create(IdentityKey {
                    identity_type: "Coinbase".into(),
                    address: Address::repeat_byte(byte),
                    claim: "a@b.com".into(),
                })
                .await
                .unwrap();
        }
        fx.manager
            .approve(Address::repeat_byte(0x02), "a@b.com")
            .await
            .unwrap();

        let pending = fx.manager.pending_for_claim("a@b.com").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].address, Address::repeat_byte(0x01));
    }

    #[tokio::test]
    async fn manager_registry_refuses_duplicate_identity_types() {
        let registry = ManagerRegistry::new();
        let fx = fixture();
        registry.register(Arc::clone(&fx.manager)).unwrap();

        let duplicate = fixture();
        assert!(matches!(
            registry.register(duplicate.manager),
            Err(ManagerError::DuplicateManager(name)) if name == "Coinbase"
        ));
        assert!(registry.get("Coinbase").is_some());
        assert!(registry.get("Twitter").is_none());
    }
}
