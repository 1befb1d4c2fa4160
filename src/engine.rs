//! The stage engine: the authoritative certificate state machine
use super::artifact::{Artifact, ArtifactStore};
use super::config::WorkflowConfig;
use super::error::WorkflowError;
use super::handoff::{HandoffEvent, HandoffGateway};
use super::ledger::{Append, CertificateRecord, Ledger, LedgerEntry};
use super::render::{DocumentRenderer, TemplateAssets};
use super::template::{Template, TemplateStore};
use super::types::{Actor, ArtifactRef, Role, Stage};
use super::utils::{content_hash, to_cbor};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// What the caller asks the engine to do with a certificate.
#[derive(minicbor::Encode, Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    #[n(0)]
    Issue,
    #[n(1)]
    Sign {
        #[cbor(n(0), with = "minicbor::bytes")]
        signature: Vec<u8>, // JPEG image
    },
    #[n(2)]
    Deliver,
}

impl Payload {
    pub fn sign(signature: impl Into<Vec<u8>>) -> Self {
        Payload::Sign {
            signature: signature.into(),
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Payload::Issue => Action::Issue,
            Payload::Sign { .. } => Action::Sign,
            Payload::Deliver => Action::Deliver,
        }
    }

    /// Identity of the payload, recorded with the transition to recognise resubmissions.
    pub fn digest(&self) -> Result<String, WorkflowError> {
        Ok(content_hash(&to_cbor(self)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Issue,
    Sign,
    Deliver,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Issue => "issue",
            Action::Sign => "sign",
            Action::Deliver => "deliver",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
    pub role: Role,
    pub action: Action,
}

pub const TRANSITIONS: [Transition; 4] = [
    Transition {
        from: Stage::Drafted,
        to: Stage::IssuedUnsigned,
        role: Role::Issuer,
        action: Action::Issue,
    },
    Transition {
        from: Stage::IssuedUnsigned,
        to: Stage::FirstSigned,
        role: Role::FirstSigner,
        action: Action::Sign,
    },
    Transition {
        from: Stage::FirstSigned,
        to: Stage::SecondSigned,
        role: Role::SecondSigner,
        action: Action::Sign,
    },
    Transition {
        from: Stage::SecondSigned,
        to: Stage::Delivered,
        role: Role::Issuer,
        action: Action::Deliver,
    },
];

impl Transition {
    pub fn out_of(stage: Stage) -> Option<Transition> {
        TRANSITIONS.iter().find(|t| t.from == stage).copied()
    }

    /// A role performs each action at most once in the workflow, so the pair names one transition.
    pub fn for_action(role: Role, action: Action) -> Option<Transition> {
        TRANSITIONS
            .iter()
            .find(|t| t.role == role && t.action == action)
            .copied()
    }

    pub fn produces_artifact(&self) -> bool {
        self.action != Action::Deliver
    }
}

enum Resolution {
    Advance(Transition),
    Replay(LedgerEntry),
}

pub struct StageEngine {
    ledger: Arc<Ledger>,
    artifacts: ArtifactStore,
    templates: TemplateStore,
    renderer: Arc<dyn DocumentRenderer>,
    gateway: Arc<dyn HandoffGateway>,
    config: WorkflowConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StageEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        artifacts: ArtifactStore,
        templates: TemplateStore,
        renderer: Arc<dyn DocumentRenderer>,
        gateway: Arc<dyn HandoffGateway>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            templates,
            renderer,
            gateway,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }
    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn lock_for(&self, certificate_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(certificate_id.to_string())
            .or_default()
            .clone()
    }

    fn release(&self, certificate_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // one count held by the map, one by us: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(certificate_id);
        }
    }

    /// Advance a certificate by one stage.
    ///
    /// Calls for the same certificate are serialized; calls for different certificates run
    /// in parallel. Resubmitting a completed transition with the same actor and payload
    /// returns the artifact it produced the first time.
    pub fn submit(
        &self,
        certificate_id: &str,
        actor: &Actor,
        payload: &Payload,
    ) -> Result<Artifact, WorkflowError> {
        let lock = self.lock_for(certificate_id);
        let result = {
            let _guard = lock.lock();
            self.submit_locked(certificate_id, actor, payload)
        };
        self.release(certificate_id, lock);
        result
    }

    fn submit_locked(
        &self,
        certificate_id: &str,
        actor: &Actor,
        payload: &Payload,
    ) -> Result<Artifact, WorkflowError> {
        let record = self.ledger.read(certificate_id)?;

        match self.resolve(&record, actor, payload)? {
            Resolution::Replay(entry) => {
                let reference = entry.artifact_ref.ok_or_else(|| {
                    WorkflowError::ArtifactNotFound(format!("{certificate_id}@{}", entry.stage))
                })?;
                tracing::debug!(
                    certificate = certificate_id,
                    stage = %entry.stage,
                    actor = actor.id(),
                    "transition already recorded, returning existing artifact"
                );
                self.artifacts.artifact(&reference)
            }
            Resolution::Advance(transition) => self.advance(&record, transition, actor, payload),
        }
    }

    fn resolve(
        &self,
        record: &CertificateRecord,
        actor: &Actor,
        payload: &Payload,
    ) -> Result<Resolution, WorkflowError> {
        let id = record.id.as_str();
        let current = record.current_stage;

        let Some(transition) = Transition::for_action(actor.role(), payload.action()) else {
            return Err(WorkflowError::unauthorized(
                Some(id),
                format!("role {} cannot {}", actor.role(), payload.action()),
            ));
        };

        if current == transition.from {
            return Ok(Resolution::Advance(transition));
        }

        if current > transition.from {
            let entry = self.ledger.entry(id, transition.to)?.ok_or_else(|| {
                anyhow::anyhow!("history of {id} has no entry for {}", transition.to)
            })?;
            if entry.actor_id != actor.id() {
                return Err(WorkflowError::unauthorized(
                    Some(id),
                    format!("{} was recorded by {}", transition.to, entry.actor_id),
                ));
            }
            if entry.payload_digest.as_deref() == Some(payload.digest()?.as_str()) {
                return Ok(Resolution::Replay(entry));
            }
            return Err(WorkflowError::AlreadyAdvanced {
                certificate_id: id.to_string(),
                current,
            });
        }

        match Transition::out_of(current) {
            Some(expected) if expected.role == actor.role() => Err(WorkflowError::InvalidPayload {
                certificate_id: id.to_string(),
                reason: format!("{current} expects {}, got {}", expected.action, payload.action()),
            }),
            Some(expected) => Err(WorkflowError::unauthorized(
                Some(id),
                format!("{current} requires role {}, got {}", expected.role, actor.role()),
            )),
            None => Err(WorkflowError::unauthorized(
                Some(id),
                format!("{id} is {current}, no further transitions"),
            )),
        }
    }

    fn advance(
        &self,
        record: &CertificateRecord,
        transition: Transition,
        actor: &Actor,
        payload: &Payload,
    ) -> Result<Artifact, WorkflowError> {
        let id = record.id.as_str();
        let renderer_failure = |source| WorkflowError::RendererFailure {
            certificate_id: id.to_string(),
            source,
        };

        let artifact_ref = match payload {
            Payload::Issue => {
                let template = self.templates.load(&record.template_id)?;
                let assets = self.load_assets(&template)?;
                let bytes = self
                    .renderer
                    .render_document(&template, &assets, &record.subject_fields)
                    .map_err(renderer_failure)?;
                self.artifacts.put(&bytes, transition.to, actor.id())?
            }
            Payload::Sign { signature } => {
                self.check_signature(id, signature)?;
                let prior = self.prior_artifact(record, transition.from)?;
                let prior = self.artifacts.get(prior)?;
                let placement = self.config.placement_for(transition.to).ok_or_else(|| {
                    anyhow::anyhow!("no signature placement configured for {}", transition.to)
                })?;
                let bytes = self
                    .renderer
                    .stamp_signature(&prior, signature, placement)
                    .map_err(renderer_failure)?;
                self.artifacts.put(&bytes, transition.to, actor.id())?
            }
            Payload::Deliver => self.prior_artifact(record, transition.from)?.clone(),
        };

        let updated = self.ledger.append(
            id,
            &Append {
                stage: transition.to,
                artifact_ref: artifact_ref.clone(),
                actor,
                payload_digest: payload.digest()?,
                produced_artifact: transition.produces_artifact(),
            },
        )?;

        tracing::info!(
            certificate = id,
            from = %transition.from,
            to = %updated.current_stage,
            actor = actor.id(),
            artifact = %artifact_ref,
            "transition recorded"
        );

        if let Some(event) = self.ledger.pending_handoff(id, transition.to)? {
            self.deliver(&event);
        }

        self.artifacts.artifact(&artifact_ref)
    }

    fn prior_artifact<'r>(
        &self,
        record: &'r CertificateRecord,
        stage: Stage,
    ) -> Result<&'r ArtifactRef, WorkflowError> {
        record
            .artifact_refs_by_stage
            .get(&stage)
            .ok_or_else(|| WorkflowError::ArtifactNotFound(format!("{}@{stage}", record.id)))
    }

    fn check_signature(&self, id: &str, signature: &[u8]) -> Result<(), WorkflowError> {
        let invalid = |reason: &str| WorkflowError::InvalidPayload {
            certificate_id: id.to_string(),
            reason: reason.to_string(),
        };
        if signature.is_empty() {
            return Err(invalid("signature image is empty"));
        }
        if self.config.require_jpeg_signatures() && !signature.starts_with(&JPEG_MAGIC) {
            return Err(invalid("only JPEG signatures are accepted"));
        }
        Ok(())
    }

    fn load_assets(&self, template: &Template) -> Result<TemplateAssets, WorkflowError> {
        let background = match template.background() {
            Some(reference) => self.artifacts.get(reference)?,
            None => vec![],
        };
        let logos = template
            .logos()
            .iter()
            .map(|logo| self.artifacts.get(&logo.asset))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TemplateAssets { background, logos })
    }

    /// Render a row against a template without recording anything.
    pub fn preview(
        &self,
        template_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, WorkflowError> {
        let template = self.templates.load(template_id)?;
        let assets = self.load_assets(&template)?;
        let bytes = self
            .renderer
            .render_document(&template, &assets, fields)
            .map_err(|source| WorkflowError::PreviewFailure {
                template_id: template_id.to_string(),
                source,
            })?;
        Ok(bytes)
    }

    fn deliver(&self, event: &HandoffEvent) -> bool {
        match self.gateway.on_stage_complete(event) {
            Ok(()) => {
                if let Err(e) = self.ledger.clear_handoff(event) {
                    // stays in the outbox and is delivered again later, consumers dedupe
                    tracing::warn!(certificate = %event.certificate_id, error = %e, "failed to clear handoff");
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    certificate = %event.certificate_id,
                    stage = %event.stage,
                    recipient = %event.recipient,
                    error = %e,
                    "handoff delivery failed, left pending"
                );
                false
            }
        }
    }

    /// Retry every handoff that has not been delivered yet. Returns how many went through.
    pub fn redeliver_pending(&self) -> Result<usize, WorkflowError> {
        let pending = self.ledger.pending_handoffs()?;
        let delivered = pending.iter().filter(|event| self.deliver(event)).count();
        if !pending.is_empty() {
            tracing::info!(pending = pending.len(), delivered, "redelivered pending handoffs");
        }
        Ok(delivered)
    }
}
