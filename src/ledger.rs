//! Durable record of each certificate's stage and its append-only history
use super::error::WorkflowError;
use super::handoff::HandoffEvent;
use super::types::{Actor, ArtifactRef, Role, Stage, TimeStamp};
use super::utils::{from_cbor, to_cbor};
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, abort};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, stable for the life of the workflow
    #[n(1)]
    pub template_id: String,
    #[n(2)]
    pub subject_fields: BTreeMap<String, String>,
    #[n(3)]
    pub current_stage: Stage,
    #[n(4)]
    pub artifact_refs_by_stage: BTreeMap<Stage, ArtifactRef>,
    #[n(5)]
    pub created_by: String,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub updated_at: TimeStamp<Utc>,
}

impl CertificateRecord {
    pub fn new(
        id: String,
        template_id: String,
        subject_fields: BTreeMap<String, String>,
        created_by: &Actor,
    ) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            template_id,
            subject_fields,
            current_stage: Stage::Drafted,
            artifact_refs_by_stage: BTreeMap::new(),
            created_by: created_by.id().to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// The newest document of the certificate, if any stage produced one yet.
    pub fn latest_artifact(&self) -> Option<&ArtifactRef> {
        self.artifact_refs_by_stage.values().next_back()
    }
}

/// One recorded transition. The creation entry at `Drafted` has no artifact and no payload.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    #[n(0)]
    pub certificate_id: String,
    #[n(1)]
    pub stage: Stage,
    #[n(2)]
    pub artifact_ref: Option<ArtifactRef>,
    #[n(3)]
    pub actor_id: String,
    #[n(4)]
    pub role: Role,
    #[n(5)]
    pub payload_digest: Option<String>,
    #[n(6)]
    pub recorded_at: TimeStamp<Utc>,
}

/// A transition the engine has validated and wants recorded.
#[derive(Debug, Clone)]
pub struct Append<'a> {
    pub stage: Stage,
    pub artifact_ref: ArtifactRef,
    pub actor: &'a Actor,
    pub payload_digest: String,
    // Delivered references the final document but did not produce it
    pub produced_artifact: bool,
}

pub struct Ledger {
    db: Arc<sled::Db>,
    records: sled::Tree,
    history: sled::Tree,
    outbox: sled::Tree,
    flush_on_commit: bool,
}

fn history_key(certificate_id: &str, stage: Stage) -> String {
    format!("{}/{:02}", certificate_id, stage.index())
}

fn unwrap_tx<T>(result: Result<T, TransactionError<WorkflowError>>) -> Result<T, WorkflowError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => WorkflowError::Storage(e),
    })
}

fn encode_tx<T: minicbor::Encode<()>>(
    value: &T,
) -> Result<Vec<u8>, ConflictableTransactionError<WorkflowError>> {
    to_cbor(value).map_err(ConflictableTransactionError::Abort)
}

impl Ledger {
    pub fn open(db: Arc<sled::Db>, flush_on_commit: bool) -> Result<Self, WorkflowError> {
        Ok(Self {
            records: db.open_tree("certificates")?,
            history: db.open_tree("history")?,
            outbox: db.open_tree("outbox")?,
            db,
            flush_on_commit,
        })
    }

    fn commit(&self) -> Result<(), WorkflowError> {
        if self.flush_on_commit {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Store a freshly drafted record together with its creation entry.
    pub fn create(&self, record: &CertificateRecord, actor: &Actor) -> Result<(), WorkflowError> {
        self.create_all(std::slice::from_ref(record), actor)
    }

    /// Store several drafted records in one transaction. Either all of them become
    /// visible or none does.
    pub fn create_all(
        &self,
        records: &[CertificateRecord],
        actor: &Actor,
    ) -> Result<(), WorkflowError> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            if record.current_stage != Stage::Drafted {
                return Err(WorkflowError::StaleTransition {
                    certificate_id: record.id.clone(),
                    current: record.current_stage,
                    attempted: Stage::Drafted,
                });
            }
            entries.push(LedgerEntry {
                certificate_id: record.id.clone(),
                stage: Stage::Drafted,
                artifact_ref: None,
                actor_id: actor.id().to_string(),
                role: actor.role(),
                payload_digest: None,
                recorded_at: record.created_at.clone(),
            });
        }

        let result = (&self.records, &self.history).transaction(|(tx_records, history)| {
            for (record, entry) in records.iter().zip(&entries) {
                if tx_records.get(record.id.as_bytes())?.is_some() {
                    // ids are fresh uuid7s, a collision means the caller reused one
                    return abort(WorkflowError::AlreadyAdvanced {
                        certificate_id: record.id.clone(),
                        current: Stage::Drafted,
                    });
                }
                tx_records.insert(record.id.as_bytes(), encode_tx(record)?)?;
                history.insert(
                    history_key(&record.id, Stage::Drafted).as_bytes(),
                    encode_tx(entry)?,
                )?;
            }
            Ok(())
        });
        unwrap_tx(result)?;
        self.commit()
    }

    /// Record a transition. Fails with `StaleTransition` unless `append.stage` directly
    /// follows the stored stage. The record, the history entry and the pending handoff
    /// are written in one transaction.
    pub fn append(
        &self,
        certificate_id: &str,
        append: &Append<'_>,
    ) -> Result<CertificateRecord, WorkflowError> {
        let now = TimeStamp::new();

        let result = (&self.records, &self.history, &self.outbox).transaction(
            |(records, history, outbox)| {
                let raw = match records.get(certificate_id.as_bytes())? {
                    Some(raw) => raw,
                    None => return abort(WorkflowError::CertificateNotFound(certificate_id.into())),
                };
                let mut record: CertificateRecord =
                    from_cbor(&raw).map_err(ConflictableTransactionError::Abort)?;

                if record.current_stage.next() != Some(append.stage) {
                    return abort(WorkflowError::StaleTransition {
                        certificate_id: certificate_id.to_string(),
                        current: record.current_stage,
                        attempted: append.stage,
                    });
                }

                record.current_stage = append.stage;
                if append.produced_artifact {
                    record
                        .artifact_refs_by_stage
                        .insert(append.stage, append.artifact_ref.clone());
                }
                record.updated_at = now.clone();

                let entry = LedgerEntry {
                    certificate_id: certificate_id.to_string(),
                    stage: append.stage,
                    artifact_ref: Some(append.artifact_ref.clone()),
                    actor_id: append.actor.id().to_string(),
                    role: append.actor.role(),
                    payload_digest: Some(append.payload_digest.clone()),
                    recorded_at: now.clone(),
                };

                records.insert(certificate_id.as_bytes(), encode_tx(&record)?)?;
                history.insert(
                    history_key(certificate_id, append.stage).as_bytes(),
                    encode_tx(&entry)?,
                )?;

                if let Some(recipient) = append.stage.handoff_recipient() {
                    let event = HandoffEvent {
                        certificate_id: certificate_id.to_string(),
                        stage: append.stage,
                        artifact_ref: Some(append.artifact_ref.clone()),
                        recipient,
                        emitted_at: now.clone(),
                    };
                    outbox.insert(event.key().as_bytes(), encode_tx(&event)?)?;
                }

                Ok(record)
            },
        );
        let record = unwrap_tx(result)?;
        self.commit()?;
        Ok(record)
    }

    pub fn read(&self, certificate_id: &str) -> Result<CertificateRecord, WorkflowError> {
        let raw = self
            .records
            .get(certificate_id.as_bytes())?
            .ok_or_else(|| WorkflowError::CertificateNotFound(certificate_id.to_string()))?;
        from_cbor(&raw)
    }

    /// Entries in stage order, starting with the creation entry.
    pub fn history(&self, certificate_id: &str) -> Result<Vec<LedgerEntry>, WorkflowError> {
        if !self.records.contains_key(certificate_id.as_bytes())? {
            return Err(WorkflowError::CertificateNotFound(certificate_id.to_string()));
        }
        let prefix = format!("{certificate_id}/");
        self.history
            .scan_prefix(prefix.as_bytes())
            .values()
            .map(|raw| from_cbor(&raw?))
            .collect()
    }

    pub fn entry(
        &self,
        certificate_id: &str,
        stage: Stage,
    ) -> Result<Option<LedgerEntry>, WorkflowError> {
        match self
            .history
            .get(history_key(certificate_id, stage).as_bytes())?
        {
            Some(raw) => Ok(Some(from_cbor(&raw)?)),
            None => Ok(None),
        }
    }

    /// All records, optionally only those currently at `stage`.
    pub fn list(&self, stage: Option<Stage>) -> Result<Vec<CertificateRecord>, WorkflowError> {
        let mut out = vec![];
        for raw in self.records.iter().values() {
            let record: CertificateRecord = from_cbor(&raw?)?;
            if stage.is_none_or(|s| s == record.current_stage) {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn pending_handoffs(&self) -> Result<Vec<HandoffEvent>, WorkflowError> {
        self.outbox
            .iter()
            .values()
            .map(|raw| from_cbor(&raw?))
            .collect()
    }

    pub fn pending_handoff(
        &self,
        certificate_id: &str,
        stage: Stage,
    ) -> Result<Option<HandoffEvent>, WorkflowError> {
        match self
            .outbox
            .get(history_key(certificate_id, stage).as_bytes())?
        {
            Some(raw) => Ok(Some(from_cbor(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn clear_handoff(&self, event: &HandoffEvent) -> Result<(), WorkflowError> {
        self.outbox.remove(event.key().as_bytes())?;
        Ok(())
    }
}
