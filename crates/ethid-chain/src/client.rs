// Narrow node interface.
//
// The EthID core assumes a single trusted node endpoint and a single
// contract type per identity namespace. Everything it needs from that node
// is expressed by the two traits below; nothing else leaks through.

use std::sync::Arc;

use async_trait::async_trait;
use ethers_core::abi::{Abi, Token};
use ethers_core::types::{Address, Bytes, H256};
use ethers_core::utils::keccak256;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::event::{BlockRef, EventStream};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("contract compilation failed: {0}")]
    Compile(String),

    #[error("contract deployment failed: {0}")]
    Deployment(String),

    #[error("node call failed: {0}")]
    Rpc(String),

    #[error("contract has no method '{0}'")]
    MethodNotFound(String),
}

/// Output of compiling a contract source: deployable bytecode plus the
/// interface description used to bind calls and decode events.
#[derive(Debug, Clone)]
pub struct CompiledContract {
    pub bytecode: Bytes,
    pub abi: Abi,
}

impl CompiledContract {
    /// Hash recorded at deployment time and later compared against the code
    /// actually living at the contract address.
    pub fn code_hash(&self) -> H256 {
        H256::from(keccak256(&self.bytecode))
    }
}

/// Handle for an in-flight contract-creation transaction.
///
/// Submission returns immediately; the contract address becomes known only
/// once the chain confirms the transaction was mined. If the transaction is
/// dropped the confirmation never arrives and [`PendingDeployment::confirmed`]
/// resolves to a [`ChainError::Deployment`].
pub struct PendingDeployment {
    pub tx_hash: H256,
    confirmed: oneshot::Receiver<Result<Address, ChainError>>,
}

impl PendingDeployment {
    pub fn new(tx_hash: H256) -> (Self, oneshot::Sender<Result<Address, ChainError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingDeployment {
                tx_hash,
                confirmed: rx,
            },
            tx,
        )
    }

    /// Wait for the chain to confirm the creation transaction. Consumes the
    /// handle: a deployment is confirmed at most once.
    pub async fn confirmed(self) -> Result<Address, ChainError> {
        match self.confirmed.await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Deployment(format!(
                "creation transaction {:#x} was dropped before confirmation",
                self.tx_hash
            ))),
        }
    }
}

/// Client for a single trusted node endpoint.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Compile contract source into deployable bytecode and an ABI.
    async fn compile(&self, source: &str) -> Result<CompiledContract, ChainError>;

    /// Submit a contract-creation transaction. Resolution of the returned
    /// handle is asynchronous and may never happen.
    async fn deploy(
        &self,
        contract: &CompiledContract,
        constructor_args: Vec<Token>,
        gas_limit: u64,
    ) -> Result<PendingDeployment, ChainError>;

    /// Bind a handle to an already-deployed contract.
    fn at(&self, address: Address, abi: &Abi) -> Arc<dyn ContractHandle>;

    /// Fetch the code currently deployed at an address. Empty bytes for an
    /// address with no contract.
    async fn get_code(&self, address: Address) -> Result<Bytes, ChainError>;
}

/// Bound contract instance.
#[async_trait]
pub trait ContractHandle: Send + Sync {
    fn address(&self) -> Address;

    /// Read-only method invocation.
    async fn call(&self, method: &str, args: Vec<Token>) -> Result<Vec<Token>, ChainError>;

    /// State-changing method invocation. Returns the transaction hash as
    /// soon as the node accepts the transaction; the effect surfaces later
    /// as an event, never through this return value.
    async fn send(&self, method: &str, args: Vec<Token>) -> Result<H256, ChainError>;

    /// Subscribe to the contract's event stream, optionally replaying from
    /// a previously observed block.
    fn subscribe(&self, from: Option<BlockRef>) -> EventStream;
}

impl std::fmt::Debug for dyn ContractHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractHandle")
            .field("address", &self.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_deployment_resolves_to_confirmed_address() {
        let (pending, confirm) = PendingDeployment::new(H256::repeat_byte(0x11));
        let address = Address::repeat_byte(0xab);
        confirm.send(Ok(address)).unwrap();
        assert_eq!(pending.confirmed().await.unwrap(), address);
    }

    #[tokio::test]
    async fn dropped_confirmation_surfaces_as_deployment_error() {
        let (pending, confirm) = PendingDeployment::new(H256::repeat_byte(0x22));
        drop(confirm);
        match pending.confirmed().await {
            Err(ChainError::Deployment(msg)) => assert!(msg.contains("dropped")),
            other => panic!("expected deployment error, got {other:?}"),
        }
    }
}
