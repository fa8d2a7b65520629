//! Contract lifecycle and event-reconciliation core.
//!
//! One deployed smart contract per identity type is the source of truth for
//! which claims are verified; the local projection store is a cache of that
//! truth. This crate owns the pieces that keep the two consistent:
//!
//! - [`registry`] records which contract backs each identity type and
//!   detects drift between the recorded code hash and the live chain.
//! - [`deploy`] resolves or creates exactly one code-correct contract per
//!   identity type and publishes the attachment state.
//! - [`projection`] holds per-claim identity records and their conditional
//!   state transitions.
//! - [`reconciler`] turns contract events into deterministic, idempotent
//!   projection transitions.
//! - [`manager`] composes the above for one identity type and exposes the
//!   approve/reject workflow the web layer calls into.

pub mod deploy;
pub mod manager;
pub mod projection;
pub mod reconciler;
pub mod registry;

pub use deploy::{AttachmentState, DeployError, DeploymentController, DeploymentIntent};
pub use manager::{ContractManager, ManagerConfig, ManagerError, ManagerRegistry};
pub use projection::{
    IdentityKey, IdentityRecord, IdentityStore, MemoryIdentityStore, ProjectionError,
    RegisterState,
};
pub use reconciler::{ClaimFormat, EventReconciler, ReconcileError};
pub use registry::{ContractRecord, ContractRegistry, RegistryError};
