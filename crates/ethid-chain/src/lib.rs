//! Chain-facing surface of EthID.
//!
//! The core never talks to a node directly; it goes through the narrow
//! [`client::ChainClient`] / [`client::ContractHandle`] traits defined here.
//! Real node bindings live behind those traits. The [`sim`] module provides an
//! in-process chain with the same surface for tests and local development.

pub mod client;
pub mod event;
pub mod sim;

pub use client::{ChainClient, ChainError, CompiledContract, ContractHandle, PendingDeployment};
pub use event::{BlockRef, EventEnvelope, EventStream, IdentityEvent};
