//! Handoff events announcing that a certificate is ready for the next role
use super::error::WorkflowError;
use super::types::{ArtifactRef, Role, Stage, TimeStamp};
use super::utils::{from_cbor, to_cbor};
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct HandoffEvent {
    #[n(0)]
    pub certificate_id: String,
    #[n(1)]
    pub stage: Stage, // the stage just reached
    #[n(2)]
    pub artifact_ref: Option<ArtifactRef>,
    #[n(3)]
    pub recipient: Role,
    #[n(4)]
    pub emitted_at: TimeStamp<Utc>,
}

impl HandoffEvent {
    /// Consumers deduplicate on this key, so redelivery is harmless.
    pub fn key(&self) -> String {
        format!("{}/{:02}", self.certificate_id, self.stage.index())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HandoffError {
    #[error("delivery to {recipient} failed: {reason}")]
    Delivery { recipient: Role, reason: String },
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Delivers stage-completion events to the next actor's inbox.
///
/// Delivery is at-least-once: the engine retries events that were not acknowledged,
/// so implementations must treat `(certificate_id, stage)` as an idempotency key.
pub trait HandoffGateway: Send + Sync {
    fn on_stage_complete(&self, event: &HandoffEvent) -> Result<(), HandoffError>;
}

/// Durable per-role inbox backed by a sled tree.
#[derive(Clone)]
pub struct SledInbox {
    inbox: sled::Tree,
}

impl SledInbox {
    pub fn open(db: &sled::Db) -> Result<Self, WorkflowError> {
        Ok(Self {
            inbox: db.open_tree("inbox")?,
        })
    }

    fn slot(role: Role, certificate_id: &str, stage: Stage) -> String {
        format!("{}/{}/{:02}", role.as_str(), certificate_id, stage.index())
    }

    /// Every undelivered event for `role`, oldest certificate id first.
    pub fn poll(&self, role: Role) -> Result<Vec<HandoffEvent>, WorkflowError> {
        let prefix = format!("{}/", role.as_str());
        self.inbox
            .scan_prefix(prefix.as_bytes())
            .values()
            .map(|raw| from_cbor(&raw?))
            .collect()
    }

    /// Remove an event once the recipient has acted on it. Unknown events are ignored.
    pub fn acknowledge(
        &self,
        role: Role,
        certificate_id: &str,
        stage: Stage,
    ) -> Result<bool, WorkflowError> {
        let removed = self
            .inbox
            .remove(Self::slot(role, certificate_id, stage).as_bytes())?;
        Ok(removed.is_some())
    }
}

impl HandoffGateway for SledInbox {
    fn on_stage_complete(&self, event: &HandoffEvent) -> Result<(), HandoffError> {
        let slot = Self::slot(event.recipient, &event.certificate_id, event.stage);
        self.inbox
            .insert(slot.as_bytes(), to_cbor(event)?)
            .map_err(WorkflowError::from)?;
        tracing::debug!(
            certificate = %event.certificate_id,
            stage = %event.stage,
            recipient = %event.recipient,
            "handoff delivered"
        );
        Ok(())
    }
}
