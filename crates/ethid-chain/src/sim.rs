// In-process simulated chain.
//
// Implements the full `ChainClient` surface against in-memory state so the
// core can be exercised without a node: deterministic compilation, explicit
// control over deployment confirmation, and a broadcast-backed event stream
// with history replay. Used by the test suites and by `ethid --dev`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers_core::abi::{Abi, Token};
use ethers_core::types::{Address, Bytes, H256};
use ethers_core::utils::keccak256;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::client::{ChainClient, ChainError, CompiledContract, ContractHandle, PendingDeployment};
use crate::event::{BlockRef, EventEnvelope, EventStream, IdentityEvent};

/// Interface of the simulated identity contract, in standard JSON ABI form.
const SIM_ABI: &str = r#"[
  {"type":"constructor","inputs":[{"name":"identityType","type":"string"}],"stateMutability":"nonpayable"},
  {"type":"function","name":"register","inputs":[{"name":"addr","type":"address"},{"name":"identityValue","type":"string"}],"outputs":[],"stateMutability":"nonpayable"},
  {"type":"function","name":"unregister","inputs":[{"name":"addr","type":"address"},{"name":"identityValue","type":"string"}],"outputs":[],"stateMutability":"nonpayable"},
  {"type":"function","name":"_setVerifiedIdentity","inputs":[{"name":"addr","type":"address"},{"name":"identityValue","type":"string"}],"outputs":[],"stateMutability":"nonpayable"},
  {"type":"function","name":"isVerified","inputs":[{"name":"addr","type":"address"},{"name":"identityValue","type":"string"}],"outputs":[{"name":"","type":"bool"}],"stateMutability":"view"},
  {"type":"function","name":"identityType","inputs":[],"outputs":[{"name":"","type":"string"}],"stateMutability":"view"},
  {"type":"event","name":"Claimed","inputs":[{"name":"addr","type":"address","indexed":false},{"name":"identityValue","type":"string","indexed":false}],"anonymous":false},
  {"type":"event","name":"Unclaimed","inputs":[{"name":"addr","type":"address","indexed":false},{"name":"identityValue","type":"string","indexed":false}],"anonymous":false},
  {"type":"event","name":"ClaimVerified","inputs":[{"name":"addr","type":"address","indexed":false},{"name":"identityValue","type":"string","indexed":false}],"anonymous":false}
]"#;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct SimContract {
    identity_type: String,
    code: RwLock<Bytes>,
    claims: DashMap<(Address, String), bool>,
    history: RwLock<Vec<EventEnvelope>>,
    events: broadcast::Sender<EventEnvelope>,
}

struct PendingInstall {
    address: Address,
    identity_type: String,
    code: Bytes,
    confirm: oneshot::Sender<Result<Address, ChainError>>,
}

struct SimInner {
    contracts: DashMap<Address, Arc<SimContract>>,
    pending: DashMap<H256, PendingInstall>,
    auto_confirm: AtomicBool,
    nonce: AtomicU64,
    height: AtomicU64,
}

impl SimInner {
    fn next_block(&self) -> BlockRef {
        BlockRef(self.height.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn emit(&self, contract: &SimContract, event: IdentityEvent) {
        let envelope = EventEnvelope {
            event,
            block: self.next_block(),
        };
        debug!(
            event = envelope.event.name(),
            block = envelope.block.0,
            "sim contract emitted event"
        );
        contract.history.write().push(envelope.clone());
        // No live subscribers is fine; history still records the event.
        let _ = contract.events.send(envelope);
    }

    fn install(&self, address: Address, identity_type: String, code: Bytes) {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.contracts.insert(
            address,
            Arc::new(SimContract {
                identity_type,
                code: RwLock::new(code),
                claims: DashMap::new(),
                history: RwLock::new(Vec::new()),
                events,
            }),
        );
    }
}

/// Simulated single-node chain.
#[derive(Clone)]
pub struct SimChain {
    inner: Arc<SimInner>,
}

impl SimChain {
    pub fn new() -> Self {
        SimChain {
            inner: Arc::new(SimInner {
                contracts: DashMap::new(),
                pending: DashMap::new(),
                auto_confirm: AtomicBool::new(true),
                nonce: AtomicU64::new(0),
                height: AtomicU64::new(0),
            }),
        }
    }

    /// When disabled, deployments stay unconfirmed until [`SimChain::confirm`]
    /// is called; never calling it models a dropped creation transaction.
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.inner.auto_confirm.store(enabled, Ordering::SeqCst);
    }

    /// Confirm a previously submitted deployment. Returns the contract
    /// address, or `None` for an unknown transaction hash.
    pub fn confirm(&self, tx_hash: H256) -> Option<Address> {
        let (_, install) = self.inner.pending.remove(&tx_hash)?;
        self.inner
            .install(install.address, install.identity_type, install.code);
        let _ = install.confirm.send(Ok(install.address));
        Some(install.address)
    }

    /// Overwrite the code stored at an address. Produces drift between a
    /// registry record and the live chain.
    pub fn set_code(&self, address: Address, code: Bytes) -> bool {
        match self.inner.contracts.get(&address) {
            Some(contract) => {
                *contract.code.write() = code;
                true
            }
            None => false,
        }
    }
}

impl Default for SimChain {
    fn default() -> Self {
        SimChain::new()
    }
}

#[async_trait]
impl ChainClient for SimChain {
    async fn compile(&self, source: &str) -> Result<CompiledContract, ChainError> {
        if source.trim().is_empty() {
            return Err(ChainError::Compile("empty contract source".into()));
        }
        let abi: Abi = serde_json::from_str(SIM_ABI)
            .map_err(|err| ChainError::Compile(format!("bad interface definition: {err}")))?;
        // Deterministic stand-in for real compilation: identical source
        // always produces identical bytecode.
        let bytecode = Bytes::from(keccak256(source.as_bytes()).to_vec());
        Ok(CompiledContract { bytecode, abi })
    }

    async fn deploy(
        &self,
        contract: &CompiledContract,
        constructor_args: Vec<Token>,
        gas_limit: u64,
    ) -> Result<PendingDeployment, ChainError> {
        if gas_limit == 0 {
            return Err(ChainError::Deployment("zero gas limit".into()));
        }
        let identity_type = match constructor_args.into_iter().next() {
            Some(Token::String(name)) => name,
            Some(other) => {
                return Err(ChainError::Deployment(format!(
                    "constructor expects a string identity type, got {other:?}"
                )))
            }
            None => String::new(),
        };

        let nonce = self.inner.nonce.fetch_add(1, Ordering::SeqCst);
        let mut seed = nonce.to_be_bytes().to_vec();
        seed.extend_from_slice(&contract.bytecode);
        let digest = keccak256(&seed);
        let address = Address::from_slice(&digest[12..]);

        let mut tx_seed = b"create".to_vec();
        tx_seed.extend_from_slice(&digest);
        let tx_hash = H256::from(keccak256(&tx_seed));

        let (pending, confirm) = PendingDeployment::new(tx_hash);
        if self.inner.auto_confirm.load(Ordering::SeqCst) {
            self.inner
                .install(address, identity_type, contract.bytecode.clone());
            let _ = confirm.send(Ok(address));
        } else {
            self.inner.pending.insert(
                tx_hash,
                PendingInstall {
                    address,
                    identity_type,
                    code: contract.bytecode.clone(),
                    confirm,
                },
            );
        }
        Ok(pending)
    }

    fn at(&self, address: Address, _abi: &Abi) -> Arc<dyn ContractHandle> {
        Arc::new(SimContractHandle {
            inner: Arc::clone(&self.inner),
            address,
        })
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, ChainError> {
        Ok(self
            .inner
            .contracts
            .get(&address)
            .map(|contract| contract.code.read().clone())
            .unwrap_or_default())
    }
}

struct SimContractHandle {
    inner: Arc<SimInner>,
    address: Address,
}

impl SimContractHandle {
    fn contract(&self) -> Result<Arc<SimContract>, ChainError> {
        self.inner
            .contracts
            .get(&self.address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ChainError::Rpc(format!("no contract at {:#x}", self.address)))
    }
}

fn expect_address(token: Option<Token>) -> Result<Address, ChainError> {
    match token {
        Some(Token::Address(address)) => Ok(address),
        other => Err(ChainError::Rpc(format!("expected address, got {other:?}"))),
    }
}

fn expect_string(token: Option<Token>) -> Result<String, ChainError> {
    match token {
        Some(Token::String(value)) => Ok(value),
        other => Err(ChainError::Rpc(format!("expected string, got {other:?}"))),
    }
}

#[async_trait]
impl ContractHandle for SimContractHandle {
    fn address(&self) -> Address {
        self.address
    }

    async fn call(&self, method: &str, args: Vec<Token>) -> Result<Vec<Token>, ChainError> {
        let contract = self.contract()?;
        match method {
            "identityType" => Ok(vec![Token::String(contract.identity_type.clone())]),
            "isVerified" => {
                let mut args = args.into_iter();
                let address = expect_address(args.next())?;
                let claim = expect_string(args.next())?;
                let verified = contract
                    .claims
                    .get(&(address, claim))
                    .map(|entry| *entry)
                    .unwrap_or(false);
                Ok(vec![Token::Bool(verified)])
            }
            other => Err(ChainError::MethodNotFound(other.into())),
        }
    }

    async fn send(&self, method: &str, args: Vec<Token>) -> Result<H256, ChainError> {
        let contract = self.contract()?;
        let mut args = args.into_iter();
        let address = expect_address(args.next())?;
        let claim = expect_string(args.next())?;
        match method {
            "register" => {
                contract.claims.insert((address, claim.clone()), false);
                self.inner
                    .emit(&contract, IdentityEvent::Claimed { address, claim });
            }
            "unregister" => {
                contract.claims.remove(&(address, claim.clone()));
                self.inner
                    .emit(&contract, IdentityEvent::Unclaimed { address, claim });
            }
            "_setVerifiedIdentity" => {
                contract.claims.insert((address, claim.clone()), true);
                self.inner
                    .emit(&contract, IdentityEvent::ClaimVerified { address, claim });
            }
            other => return Err(ChainError::MethodNotFound(other.into())),
        }

        let nonce = self.inner.nonce.fetch_add(1, Ordering::SeqCst);
        let mut seed = method.as_bytes().to_vec();
        seed.extend_from_slice(&nonce.to_be_bytes());
        Ok(H256::from(keccak256(&seed)))
    }

    fn subscribe(&self, from: Option<BlockRef>) -> EventStream {
        let contract = match self.contract() {
            Ok(contract) => contract,
            Err(_) => return stream::empty().boxed(),
        };
        let live = BroadcastStream::new(contract.events.subscribe())
            .filter_map(|result| async move { result.ok() });
        match from {
            Some(block) => {
                let replay: Vec<EventEnvelope> = contract
                    .history
                    .read()
                    .iter()
                    .filter(|envelope| envelope.block >= block)
                    .cloned()
                    .collect();
                stream::iter(replay).chain(live).boxed()
            }
            None => live.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn deployed(chain: &SimChain, identity_type: &str) -> Arc<dyn ContractHandle> {
        let compiled = chain.compile("contract EthID {}").await.unwrap();
        let pending = chain
            .deploy(
                &compiled,
                vec![Token::String(identity_type.into())],
                1_000_000,
            )
            .await
            .unwrap();
        let address = pending.confirmed().await.unwrap();
        chain.at(address, &compiled.abi)
    }

    #[tokio::test]
    async fn compilation_is_deterministic() {
        let chain = SimChain::new();
        let a = chain.compile("contract EthID {}").await.unwrap();
        let b = chain.compile("contract EthID {}").await.unwrap();
        assert_eq!(a.code_hash(), b.code_hash());
        let c = chain.compile("contract EthID { uint x; }").await.unwrap();
        assert_ne!(a.code_hash(), c.code_hash());
    }

    #[tokio::test]
    async fn empty_source_fails_compilation() {
        let chain = SimChain::new();
        assert!(matches!(
            chain.compile("   ").await,
            Err(ChainError::Compile(_))
        ));
    }

    #[tokio::test]
    async fn deployed_code_matches_compiled_hash() {
        let chain = SimChain::new();
        let compiled = chain.compile("contract EthID {}").await.unwrap();
        let pending = chain
            .deploy(&compiled, vec![Token::String("Coinbase".into())], 1_000_000)
            .await
            .unwrap();
        let address = pending.confirmed().await.unwrap();
        let live = chain.get_code(address).await.unwrap();
        assert_eq!(H256::from(keccak256(&live)), compiled.code_hash());
    }

    #[tokio::test]
    async fn manual_confirmation_installs_the_contract() {
        let chain = SimChain::new();
        chain.set_auto_confirm(false);
        let compiled = chain.compile("contract EthID {}").await.unwrap();
        let pending = chain
            .deploy(&compiled, vec![Token::String("Twitter".into())], 1_000_000)
            .await
            .unwrap();
        let tx_hash = pending.tx_hash;
        assert!(chain.get_code(Address::zero()).await.unwrap().is_empty());

        let address = chain.confirm(tx_hash).unwrap();
        assert_eq!(pending.confirmed().await.unwrap(), address);
        assert!(!chain.get_code(address).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_emits_claimed_to_live_subscribers() {
        let chain = SimChain::new();
        let contract = deployed(&chain, "Coinbase").await;
        let mut events = contract.subscribe(None);

        let addr = Address::repeat_byte(0x01);
        contract
            .send(
                "register",
                vec![Token::Address(addr), Token::String("a@b.com".into())],
            )
            .await
            .unwrap();

        let envelope = events.next().await.unwrap();
        assert_eq!(
            envelope.event,
            IdentityEvent::Claimed {
                address: addr,
                claim: "a@b.com".into()
            }
        );
    }

    #[tokio::test]
    async fn subscription_replays_history_from_block() {
        let chain = SimChain::new();
        let contract = deployed(&chain, "Coinbase").await;
        let addr = Address::repeat_byte(0x02);
        contract
            .send(
                "register",
                vec![Token::Address(addr), Token::String("a@b.com".into())],
            )
            .await
            .unwrap();
        contract
            .send(
                "_setVerifiedIdentity",
                vec![Token::Address(addr), Token::String("a@b.com".into())],
            )
            .await
            .unwrap();

        let mut replayed = contract.subscribe(Some(BlockRef(0)));
        assert_eq!(replayed.next().await.unwrap().event.name(), "Claimed");
        assert_eq!(replayed.next().await.unwrap().event.name(), "ClaimVerified");
    }

    #[tokio::test]
    async fn is_verified_reflects_contract_state() {
        let chain = SimChain::new();
        let contract = deployed(&chain, "Coinbase").await;
        let addr = Address::repeat_byte(0x03);
        let args = vec![Token::Address(addr), Token::String("a@b.com".into())];

        contract.send("register", args.clone()).await.unwrap();
        assert_eq!(
            contract.call("isVerified", args.clone()).await.unwrap(),
            vec![Token::Bool(false)]
        );

        contract
            .send("_setVerifiedIdentity", args.clone())
            .await
            .unwrap();
        assert_eq!(
            contract.call("isVerified", args).await.unwrap(),
            vec![Token::Bool(true)]
        );
    }
}
