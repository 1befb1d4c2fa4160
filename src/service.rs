//! Service layer API for certificate workflow operations
use super::artifact::{Artifact, ArtifactStore};
use super::auth::{Authenticator, Credentials, StaticAuthenticator};
use super::batch::{BatchCoordinator, BatchOutcome};
use super::config::WorkflowConfig;
use super::engine::{Payload, StageEngine};
use super::error::WorkflowError;
use super::handoff::{HandoffEvent, HandoffGateway, SledInbox};
use super::ledger::{CertificateRecord, Ledger, LedgerEntry};
use super::render::DocumentRenderer;
use super::template::{Template, TemplateStore};
use super::types::{Actor, ArtifactRef, Role, Stage};
use super::utils::new_uuid_to_bech32;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A certificate as a client sees it: current record plus its full history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateView {
    pub record: CertificateRecord,
    pub history: Vec<LedgerEntry>,
}

pub struct CertificateService {
    engine: Arc<StageEngine>,
    batches: BatchCoordinator,
    inbox: SledInbox,
    authenticator: Arc<dyn Authenticator>,
}

fn require_role(actor: &Actor, role: Role) -> Result<(), WorkflowError> {
    if actor.role() != role {
        return Err(WorkflowError::unauthorized(
            None,
            format!("{} requires role {role}, got {}", actor.id(), actor.role()),
        ));
    }
    Ok(())
}

impl CertificateService {
    /// Open the workflow on `instance`, delivering handoffs into the database's own inbox.
    pub fn new(
        instance: Arc<sled::Db>,
        renderer: Arc<dyn DocumentRenderer>,
        config: WorkflowConfig,
    ) -> Result<Self, WorkflowError> {
        let inbox = SledInbox::open(&instance)?;
        Self::with_gateway(instance, renderer, Arc::new(inbox), config)
    }

    pub fn with_gateway(
        instance: Arc<sled::Db>,
        renderer: Arc<dyn DocumentRenderer>,
        gateway: Arc<dyn HandoffGateway>,
        config: WorkflowConfig,
    ) -> Result<Self, WorkflowError> {
        let ledger = Arc::new(Ledger::open(instance.clone(), config.flush_on_commit())?);
        let engine = Arc::new(StageEngine::new(
            ledger,
            ArtifactStore::open(&instance)?,
            TemplateStore::open(&instance)?,
            renderer,
            gateway,
            config,
        ));
        let batches = BatchCoordinator::open(&instance, engine.clone())?;
        let inbox = SledInbox::open(&instance)?;

        // handoffs committed before a crash or a failed delivery
        engine.redeliver_pending()?;

        Ok(Self {
            engine,
            batches,
            inbox,
            authenticator: Arc::new(StaticAuthenticator::new()),
        })
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn engine(&self) -> &Arc<StageEngine> {
        &self.engine
    }

    pub fn authenticate(&self, credentials: &Credentials) -> Result<Actor, WorkflowError> {
        self.authenticator.authenticate(credentials)
    }

    /// Store a background or logo image for use in templates
    pub fn upload_asset(&self, actor: &Actor, bytes: &[u8]) -> Result<ArtifactRef, WorkflowError> {
        require_role(actor, Role::Issuer)?;
        if bytes.is_empty() {
            return Err(anyhow::anyhow!("asset upload is empty").into());
        }
        self.engine.artifacts().put(bytes, Stage::Drafted, actor.id())
    }

    /// Register a template. Its id is the hash of its contents, so it can never change afterwards.
    pub fn register_template(
        &self,
        actor: &Actor,
        template: Template,
    ) -> Result<String, WorkflowError> {
        require_role(actor, Role::Issuer)?;

        let template = if template.owner().is_some() {
            template
        } else {
            template.set_owner(actor.id())
        };
        for asset in template.asset_refs() {
            if !self.engine.artifacts().contains(asset)? {
                return Err(WorkflowError::ArtifactNotFound(asset.to_string()));
            }
        }

        let template_id = self.engine.templates().register(&template)?;
        tracing::info!(template = %template_id, actor = actor.id(), "template registered");
        Ok(template_id)
    }

    /// Render a row without creating anything
    pub fn preview(
        &self,
        template_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, WorkflowError> {
        self.engine.preview(template_id, fields)
    }

    /// Create one drafted certificate per row. Rows are all validated first and stored in one
    /// transaction, so either every row becomes a certificate or none does.
    pub fn create_certificates(
        &self,
        actor: &Actor,
        template_id: &str,
        rows: Vec<BTreeMap<String, String>>,
    ) -> Result<Vec<String>, WorkflowError> {
        require_role(actor, Role::Issuer)?;
        let template = self.engine.templates().load(template_id)?;

        for (row, fields) in rows.iter().enumerate() {
            if let Some(field) = template.missing_field(fields) {
                return Err(WorkflowError::InvalidRow {
                    row,
                    field: field.to_string(),
                });
            }
        }

        let hrp = self.engine.config().certificate_hrp();
        let mut records = Vec::with_capacity(rows.len());
        for fields in rows {
            let id = new_uuid_to_bech32(hrp)?;
            records.push(CertificateRecord::new(id, template_id.to_string(), fields, actor));
        }
        self.engine.ledger().create_all(&records, actor)?;
        let ids: Vec<String> = records.into_iter().map(|record| record.id).collect();

        tracing::info!(
            template = template_id,
            created = ids.len(),
            actor = actor.id(),
            "certificates drafted"
        );
        Ok(ids)
    }

    pub fn submit(
        &self,
        certificate_id: &str,
        actor: &Actor,
        payload: &Payload,
    ) -> Result<Artifact, WorkflowError> {
        self.engine.submit(certificate_id, actor, payload)
    }

    pub fn create_batch<I, S>(&self, certificate_ids: I, actor: &Actor) -> Result<String, WorkflowError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.batches.create_batch(certificate_ids, actor)
    }

    /// Advance every member of a batch by one stage
    pub fn submit_batch(
        &self,
        batch_id: &str,
        payload: &Payload,
    ) -> Result<BatchOutcome, WorkflowError> {
        self.batches.submit_batch(batch_id, payload)
    }

    pub fn batch_status(&self, batch_id: &str) -> Result<BTreeMap<String, Stage>, WorkflowError> {
        self.batches.status(batch_id)
    }

    pub fn is_batch_open(&self, batch_id: &str) -> Result<bool, WorkflowError> {
        self.batches.is_open(batch_id)
    }

    pub fn get_certificate(&self, certificate_id: &str) -> Result<CertificateView, WorkflowError> {
        let ledger = self.engine.ledger();
        Ok(CertificateView {
            record: ledger.read(certificate_id)?,
            history: ledger.history(certificate_id)?,
        })
    }

    pub fn get_artifact(&self, reference: &str) -> Result<Vec<u8>, WorkflowError> {
        self.engine.artifacts().get(&ArtifactRef::parse(reference)?)
    }

    /// Certificates currently waiting at `stage`
    pub fn pending_for(&self, stage: Stage) -> Result<Vec<CertificateRecord>, WorkflowError> {
        self.engine.ledger().list(Some(stage))
    }

    pub fn inbox(&self, role: Role) -> Result<Vec<HandoffEvent>, WorkflowError> {
        self.inbox.poll(role)
    }

    pub fn acknowledge(
        &self,
        role: Role,
        certificate_id: &str,
        stage: Stage,
    ) -> Result<bool, WorkflowError> {
        self.inbox.acknowledge(role, certificate_id, stage)
    }
}
