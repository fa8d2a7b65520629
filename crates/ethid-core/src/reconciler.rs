// Event reconciler.
//
// Converts each contract event into a deterministic transition of the
// identity projection. Delivery is at-least-once and not necessarily in
// emission order, so every rule here is idempotent under redelivery, and a
// bad event is logged and dropped rather than stopping the subscription.
//
// Handlers run independently per event but serialize per
// (identity type, address, claim) key: concurrent events touching the same
// record never interleave their read-modify-write.

use std::sync::Arc;

use dashmap::DashMap;
use ethers_core::types::Address;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ethid_chain::{EventEnvelope, EventStream, IdentityEvent};

use crate::projection::{
    IdentityKey, IdentityStore, ProjectionError, RegisterState,
};

/// Shape a claim value must have for a given identity type. Events carrying
/// malformed claims are dropped before they touch the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimFormat {
    /// Plain email address, e.g. `a@b.com`.
    Email,

    /// Profile link: `http(s)://` URL or a `mailto:` fallback.
    ProfileUri,
}

impl ClaimFormat {
    pub fn is_valid(&self, claim: &str) -> bool {
        if claim.is_empty() || claim.chars().any(char::is_whitespace) {
            return false;
        }
        match self {
            ClaimFormat::Email => is_valid_email(claim),
            ClaimFormat::ProfileUri => {
                claim.starts_with("http://")
                    || claim.starts_with("https://")
                    || claim
                        .strip_prefix("mailto:")
                        .map(is_valid_email)
                        .unwrap_or(false)
            }
        }
    }
}

fn is_valid_email(claim: &str) -> bool {
    match claim.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        None => false,
    }
}

impl std::fmt::Display for ClaimFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimFormat::Email => f.write_str("email"),
            ClaimFormat::ProfileUri => f.write_str("profile URI"),
        }
    }
}

/// An event referenced projection state that does not exist or cannot accept
/// the transition. Recovered locally: logged, never fatal to the
/// subscription loop, and the projection is left unmodified.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no identity record matches {0}")]
    MissingRecord(IdentityKey),

    #[error("identity {key} is {found}, expected verifying")]
    NotVerifying {
        key: IdentityKey,
        found: RegisterState,
    },

    #[error("claim '{claim}' is not a valid {format} value")]
    MalformedClaim { claim: String, format: ClaimFormat },

    #[error("address {address:#x} is already verified as '{existing}'; new claims require an explicit unlink first")]
    VerifiedConflict { address: Address, existing: String },

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// Drives the identity state machine from a contract's event stream.
pub struct EventReconciler {
    identity_type: String,
    claim_format: ClaimFormat,
    store: Arc<dyn IdentityStore>,
    key_locks: DashMap<IdentityKey, Arc<Mutex<()>>>,
}

impl EventReconciler {
    pub fn new(
        identity_type: impl Into<String>,
        claim_format: ClaimFormat,
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        EventReconciler {
            identity_type: identity_type.into(),
            claim_format,
            store,
            key_locks: DashMap::new(),
        }
    }

    /// Consume the subscription until it closes. Each envelope is handled in
    /// its own task; the per-key lock inside `apply` provides the required
    /// serialization, and failures never terminate the loop.
    pub async fn run(self: Arc<Self>, mut events: EventStream) {
        while let Some(envelope) = events.next().await {
            let reconciler = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = reconciler.apply(&envelope).await {
                    warn!(
                        identity_type = %reconciler.identity_type,
                        event = envelope.event.name(),
                        block = envelope.block.0,
                        error = %err,
                        "event reconciliation failed"
                    );
                }
            });
        }
        info!(identity_type = %self.identity_type, "event stream closed");
    }

    /// Apply one event to the projection.
    pub async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ReconcileError> {
        let claim = envelope.event.claim();
        if !self.claim_format.is_valid(claim) {
            return Err(ReconcileError::MalformedClaim {
                claim: claim.to_string(),
                format: self.claim_format,
            });
        }

        let key = IdentityKey {
            identity_type: self.identity_type.clone(),
            address: envelope.event.address(),
            claim: claim.to_string(),
        };

        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        debug!(
            identity_type = %self.identity_type,
            event = envelope.event.name(),
            key = %key,
            block = envelope.block.0,
            "reconciling event"
        );
        match &envelope.event {
            IdentityEvent::Claimed { .. } => self.on_claimed(key).await,
            IdentityEvent::Unclaimed { .. } => self.on_unclaimed(key).await,
            IdentityEvent::ClaimVerified { .. } => self.on_claim_verified(key).await,
        }
    }

    /// `Claimed`: find-or-create the pending record.
    ///
    /// Redelivery for an existing tuple is a no-op in any state. A claim for
    /// an address whose record is already verified under a different value
    /// is rejected; a verified claim is only superseded through an explicit
    /// unlink/relink, never silently. Distinct claim values are allowed to
    /// coexist as concurrent pending attempts before verification.
    async fn on_claimed(&self, key: IdentityKey) -> Result<(), ReconcileError> {
        if self.store.find(&key).await.is_some() {
            debug!(key = %key, "claim already projected, ignoring redelivery");
            return Ok(());
        }

        for record in self
            .store
            .find_by_address(&self.identity_type, key.address)
            .await
        {
            if record.state == RegisterState::Verified {
                return Err(ReconcileError::VerifiedConflict {
                    address: key.address,
                    existing: record.claim,
                });
            }
        }

        let record = match self.store.create(key.clone()).await {
            Ok(record) => record,
            // Lost a race against a concurrent redelivery of the same event.
            Err(ProjectionError::AlreadyExists(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        info!(key = %key, state = %record.state, "claim projected");
        Ok(())
    }

    /// `Unclaimed`: remove the matching record in any state. The chain
    /// unclaiming something the projection never had is a reconciliation
    /// error; events may arrive out of order or be replayed.
    async fn on_unclaimed(&self, key: IdentityKey) -> Result<(), ReconcileError> {
        match self.store.remove(&key).await {
            Ok(record) => {
                info!(key = %key, state = %record.state, "claim removed");
                Ok(())
            }
            Err(ProjectionError::NotFound(_)) => Err(ReconcileError::MissingRecord(key)),
            Err(err) => Err(err.into()),
        }
    }

    /// `ClaimVerified`: requires a record in `verifying` state. A missing
    /// record means the projection missed the approval request or the event
    /// is a replay of an unlinked claim; do not fabricate a record. An
    /// already-verified record is a redelivery and a no-op.
    async fn on_claim_verified(&self, key: IdentityKey) -> Result<(), ReconcileError> {
        let record = self
            .store
            .find(&key)
            .await
            .ok_or_else(|| ReconcileError::MissingRecord(key.clone()))?;
        match record.state {
            RegisterState::Verified => {
                debug!(key = %key, "claim already verified, ignoring redelivery");
                Ok(())
            }
            RegisterState::Verifying => {
                self.store
                    .transition(&key, RegisterState::Verifying, RegisterState::Verified)
                    .await?;
                info!(key = %key, "claim verified");
                Ok(())
            }
            found => Err(ReconcileError::NotVerifying { key, found }),
        }
    }
}
