// Deployment controller.
//
// Ensures exactly one live, code-correct contract per identity type:
// resolves the registry record, verifies the live code against the recorded
// hash, and deploys a replacement when the record is missing or stale.
// The controller never reports attachment before the chain confirms the
// creation transaction, and it never leaves two records referenced as "the"
// contract for one identity type.

use std::sync::Arc;

use ethers_core::abi::Token;
use ethers_core::types::{Address, H256};
use ethers_core::utils::keccak256;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use ethid_chain::{ChainClient, ChainError, CompiledContract, ContractHandle};

use crate::registry::{ContractRecord, ContractRegistry, RegistryError};

/// Where an identity type stands in the attach lifecycle. Published through
/// a watch channel so callers can observe progress without blocking on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentState {
    /// No attachment attempt has completed.
    Detached,

    /// A creation transaction was submitted and has not been confirmed.
    /// There is no automatic retry of a stuck deploy; leaving this state
    /// without confirmation takes an operator re-invoking attachment.
    Deploying { tx_hash: H256 },

    /// A confirmed, code-correct contract is live for this identity type.
    Attached { address: Address },

    /// Compilation or deployment failed; fatal for this identity type until
    /// an operator intervenes.
    Failed { reason: String },
}

impl AttachmentState {
    pub fn is_attached(&self) -> bool {
        matches!(self, AttachmentState::Attached { .. })
    }
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentState::Detached => write!(f, "detached"),
            AttachmentState::Deploying { tx_hash } => write!(f, "deploying ({tx_hash:#x})"),
            AttachmentState::Attached { address } => write!(f, "attached ({address:#x})"),
            AttachmentState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Output of the compile step, consumed exactly once by a deployment.
pub struct DeploymentIntent {
    pub identity_type: String,
    pub contract: CompiledContract,
}

pub struct DeploymentController {
    identity_type: String,
    chain: Arc<dyn ChainClient>,
    registry: Arc<ContractRegistry>,
    gas_limit: u64,
    state: watch::Sender<AttachmentState>,
}

impl DeploymentController {
    pub fn new(
        identity_type: impl Into<String>,
        chain: Arc<dyn ChainClient>,
        registry: Arc<ContractRegistry>,
        gas_limit: u64,
    ) -> Self {
        let (state, _) = watch::channel(AttachmentState::Detached);
        DeploymentController {
            identity_type: identity_type.into(),
            chain,
            registry,
            gas_limit,
            state,
        }
    }

    pub fn identity_type(&self) -> &str {
        &self.identity_type
    }

    /// Observe attachment progress. The receiver outlives the in-flight
    /// attach call, so a caller can give up waiting while the deployment
    /// itself keeps running.
    pub fn state(&self) -> watch::Receiver<AttachmentState> {
        self.state.subscribe()
    }

    /// Resolve or create the contract for this identity type.
    ///
    /// compile -> resolve record -> (verify code | deploy) -> save -> attached.
    /// Each step must succeed before the next runs; a compile or deploy
    /// failure leaves the identity type un-attached and is surfaced to the
    /// operator rather than retried.
    pub async fn attach(&self, source: &str) -> Result<Arc<dyn ContractHandle>, DeployError> {
        let compiled = match self.chain.compile(source).await {
            Ok(compiled) => compiled,
            Err(err) => {
                self.fail(&err);
                return Err(err.into());
            }
        };

        match self.registry.resolve(&self.identity_type) {
            Some(record) => self.verify_existing(record, compiled).await,
            None => {
                let intent = DeploymentIntent {
                    identity_type: self.identity_type.clone(),
                    contract: compiled,
                };
                self.deploy_new(intent).await
            }
        }
    }

    /// Check a previously recorded contract against the live chain. A record
    /// is valid only while the code at its address still hashes to the value
    /// recorded at deployment time; otherwise it is invalidated and replaced.
    async fn verify_existing(
        &self,
        record: ContractRecord,
        compiled: CompiledContract,
    ) -> Result<Arc<dyn ContractHandle>, DeployError> {
        let live_code = self.chain.get_code(record.address).await?;
        let live_hash = H256::from(keccak256(&live_code));
        let compiled_hash = compiled.code_hash();

        if live_hash == record.code_hash && compiled_hash == record.code_hash {
            info!(
                identity_type = %self.identity_type,
                address = %format!("{:#x}", record.address),
                "using existing contract"
            );
            let handle = self.chain.at(record.address, &compiled.abi);
            self.state
                .send_replace(AttachmentState::Attached { address: record.address });
            return Ok(handle);
        }

        if live_hash != record.code_hash {
            warn!(
                identity_type = %self.identity_type,
                address = %format!("{:#x}", record.address),
                "live contract code drifted from recorded hash, re-deploying"
            );
        } else {
            warn!(
                identity_type = %self.identity_type,
                address = %format!("{:#x}", record.address),
                "compiled contract differs from recorded deployment, re-deploying"
            );
        }
        self.registry.invalidate(&record);
        let intent = DeploymentIntent {
            identity_type: self.identity_type.clone(),
            contract: compiled,
        };
        self.deploy_new(intent).await
    }

    /// Submit a creation transaction and wait for the chain to confirm it.
    /// The wait is unbounded; progress is visible through the watch channel.
    async fn deploy_new(
        &self,
        intent: DeploymentIntent,
    ) -> Result<Arc<dyn ContractHandle>, DeployError> {
        let constructor_args = vec![Token::String(intent.identity_type.clone())];
        let pending = match self
            .chain
            .deploy(&intent.contract, constructor_args, self.gas_limit)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                self.fail(&err);
                return Err(err.into());
            }
        };

        info!(
            identity_type = %intent.identity_type,
            tx_hash = %format!("{:#x}", pending.tx_hash),
            "contract creation submitted"
        );
        self.state.send_replace(AttachmentState::Deploying {
            tx_hash: pending.tx_hash,
        });

        let address = match pending.confirmed().await {
            Ok(address) => address,
            Err(err) => {
                self.fail(&err);
                return Err(err.into());
            }
        };

        let abi = serde_json::to_string(&intent.contract.abi)
            .map_err(|err| ChainError::Deployment(format!("unserializable interface: {err}")))?;
        let record = ContractRecord {
            identity_type: intent.identity_type.clone(),
            address,
            abi,
            code_hash: intent.contract.code_hash(),
        };
        self.registry.save(record)?;

        info!(
            identity_type = %intent.identity_type,
            address = %format!("{:#x}", address),
            "contract deployed and recorded"
        );
        let handle = self.chain.at(address, &intent.contract.abi);
        self.state
            .send_replace(AttachmentState::Attached { address });
        Ok(handle)
    }

    fn fail(&self, err: &ChainError) {
        self.state.send_replace(AttachmentState::Failed {
            reason: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ethid_chain::sim::SimChain;

    const SOURCE: &str = "contract EthID { mapping(address => string) identities; }";

    fn controller(chain: &SimChain, registry: &Arc<ContractRegistry>) -> DeploymentController {
        DeploymentController::new(
            "Coinbase",
            Arc::new(chain.clone()),
            Arc::clone(registry),
            1_000_000,
        )
    }

    #[tokio::test]
    async fn fresh_attach_deploys_and_records_the_contract() {
        let chain = SimChain::new();
        let registry = Arc::new(ContractRegistry::new());
        let ctl = controller(&chain, &registry);

        let handle = ctl.attach(SOURCE).await.unwrap();

        let record = registry.resolve("Coinbase").unwrap();
        assert_eq!(record.address, handle.address());

        let compiled = chain.compile(SOURCE).await.unwrap();
        assert_eq!(record.code_hash, compiled.code_hash());
        assert!(ctl.state().borrow().is_attached());
    }

    #[tokio::test]
    async fn second_attach_reuses_the_recorded_contract() {
        let chain = SimChain::new();
        let registry = Arc::new(ContractRegistry::new());

        let first = controller(&chain, &registry).attach(SOURCE).await.unwrap();
        let second = controller(&chain, &registry).attach(SOURCE).await.unwrap();

        assert_eq!(first.address(), second.address());
        assert_eq!(registry.identity_types().len(), 1);
    }

    #[tokio::test]
    async fn drifted_code_is_invalidated_and_redeployed_once() {
        let chain = SimChain::new();
        let registry = Arc::new(ContractRegistry::new());

        let original = controller(&chain, &registry).attach(SOURCE).await.unwrap();
        chain.set_code(original.address(), vec![0xde, 0xad].into());

        let replacement = controller(&chain, &registry).attach(SOURCE).await.unwrap();
        assert_ne!(replacement.address(), original.address());

        // Exactly one live record, pointing at the replacement.
        assert_eq!(registry.identity_types().len(), 1);
        assert_eq!(
            registry.resolve("Coinbase").unwrap().address,
            replacement.address()
        );
    }

    #[tokio::test]
    async fn changed_source_replaces_the_recorded_contract() {
        let chain = SimChain::new();
        let registry = Arc::new(ContractRegistry::new());

        let original = controller(&chain, &registry).attach(SOURCE).await.unwrap();
        let replacement = controller(&chain, &registry)
            .attach("contract EthID { uint version = 2; }")
            .await
            .unwrap();

        assert_ne!(replacement.address(), original.address());
        assert_eq!(registry.identity_types().len(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_deploy_stays_in_deploying_state() {
        let chain = SimChain::new();
        chain.set_auto_confirm(false);
        let registry = Arc::new(ContractRegistry::new());
        let ctl = Arc::new(controller(&chain, &registry));
        let mut state = ctl.state();

        let attach = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.attach(SOURCE).await.map(|handle| handle.address()) })
        };

        // Wait until the creation transaction is submitted, then give the
        // (never-arriving) confirmation a moment.
        state
            .wait_for(|s| matches!(s, AttachmentState::Deploying { .. }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            &*ctl.state().borrow(),
            AttachmentState::Deploying { .. }
        ));
        assert!(registry.resolve("Coinbase").is_none());
        assert!(!attach.is_finished());

        // Operator-driven confirmation completes the attach.
        let tx_hash = match &*ctl.state().borrow() {
            AttachmentState::Deploying { tx_hash } => *tx_hash,
            other => panic!("unexpected state {other}"),
        };
        let address = chain.confirm(tx_hash).unwrap();
        assert_eq!(attach.await.unwrap().unwrap(), address);
        assert!(ctl.state().borrow().is_attached());
    }

    #[tokio::test]
    async fn compile_failure_is_fatal_for_the_identity_type() {
        let chain = SimChain::new();
        let registry = Arc::new(ContractRegistry::new());
        let ctl = controller(&chain, &registry);

        let err = ctl.attach("   ").await.unwrap_err();
        assert!(matches!(err, DeployError::Chain(ChainError::Compile(_))));
        assert!(matches!(
            &*ctl.state().borrow(),
            AttachmentState::Failed { .. }
        ));
        assert!(registry.resolve("Coinbase").is_none());
    }
}
