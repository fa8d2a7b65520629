// Contract event surface.
//
// The identity contracts emit a fixed, versioned set of events. They are
// modeled as a closed enum so that handling a new event name is a
// compile-time change, not a string lookup at dispatch time.

use ethers_core::types::Address;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Block height an event was observed at; doubles as the resumption point
/// when a subscription is restarted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockRef(pub u64);

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Closed set of events an identity contract emits.
///
/// Every variant carries the acting address and the claim value; there is no
/// other payload in the contract interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityEvent {
    /// An address asserted ownership of a claim value.
    Claimed { address: Address, claim: String },

    /// An address released a previously asserted claim.
    Unclaimed { address: Address, claim: String },

    /// The contract recorded the claim as verified.
    ClaimVerified { address: Address, claim: String },
}

impl IdentityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            IdentityEvent::Claimed { .. } => "Claimed",
            IdentityEvent::Unclaimed { .. } => "Unclaimed",
            IdentityEvent::ClaimVerified { .. } => "ClaimVerified",
        }
    }

    pub fn address(&self) -> Address {
        match self {
            IdentityEvent::Claimed { address, .. }
            | IdentityEvent::Unclaimed { address, .. }
            | IdentityEvent::ClaimVerified { address, .. } => *address,
        }
    }

    pub fn claim(&self) -> &str {
        match self {
            IdentityEvent::Claimed { claim, .. }
            | IdentityEvent::Unclaimed { claim, .. }
            | IdentityEvent::ClaimVerified { claim, .. } => claim,
        }
    }
}

/// An event together with the block it was observed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: IdentityEvent,
    pub block: BlockRef,
}

/// Lazy event sequence produced by a subscription.
///
/// Delivery is at-least-once and not necessarily in emission order across a
/// restart or node failover; consumers must treat every envelope as a
/// possible redelivery.
pub type EventStream = BoxStream<'static, EventEnvelope>;
