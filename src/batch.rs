//! Batches group certificates that are submitted together for one stage transition
use super::artifact::Artifact;
use super::engine::{Payload, StageEngine, Transition};
use super::error::WorkflowError;
use super::types::{Actor, Stage, TimeStamp};
use super::utils::{from_cbor, new_uuid_to_bech32, to_cbor};
use chrono::Utc;
use parking_lot::Mutex;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub certificate_ids: BTreeSet<String>,
    #[n(2)]
    pub submitted_by: Actor,
    #[n(3)]
    pub submitted_at: TimeStamp<Utc>,
    #[n(4)]
    pub targets: BTreeMap<String, Stage>, // stage each member reaches once the batch is done
}

pub type BatchOutcome = BTreeMap<String, Result<Artifact, WorkflowError>>;

pub struct BatchCoordinator {
    engine: Arc<StageEngine>,
    batches: sled::Tree,
    open_batches: sled::Tree, // certificate id -> id of the batch it was last placed in
    membership: Mutex<()>,
}

impl BatchCoordinator {
    pub fn open(db: &sled::Db, engine: Arc<StageEngine>) -> Result<Self, WorkflowError> {
        Ok(Self {
            engine,
            batches: db.open_tree("batches")?,
            open_batches: db.open_tree("open_batches")?,
            membership: Mutex::new(()),
        })
    }

    pub fn load(&self, batch_id: &str) -> Result<Batch, WorkflowError> {
        let raw = self
            .batches
            .get(batch_id.as_bytes())?
            .ok_or_else(|| WorkflowError::BatchNotFound(batch_id.to_string()))?;
        from_cbor(&raw)
    }

    /// Group certificates for one transition. Every id must exist and sit at the same stage,
    /// `actor` must own that stage's next step, and no id may sit in another open batch.
    pub fn create_batch<I, S>(&self, certificate_ids: I, actor: &Actor) -> Result<String, WorkflowError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let certificate_ids: BTreeSet<String> =
            certificate_ids.into_iter().map(Into::into).collect();
        if certificate_ids.is_empty() {
            return Err(WorkflowError::EmptyBatch);
        }

        let _membership = self.membership.lock();
        let ledger = self.engine.ledger();

        let mut step: Option<Transition> = None;
        let mut targets = BTreeMap::new();
        for id in &certificate_ids {
            let record = ledger.read(id)?;
            let Some(transition) = Transition::out_of(record.current_stage) else {
                return Err(WorkflowError::AlreadyAdvanced {
                    certificate_id: id.clone(),
                    current: record.current_stage,
                });
            };
            if transition.role != actor.role() {
                return Err(WorkflowError::unauthorized(
                    Some(id.as_str()),
                    format!(
                        "{} requires role {}, got {}",
                        record.current_stage,
                        transition.role,
                        actor.role()
                    ),
                ));
            }
            // one batch, one transition
            match step {
                Some(first) if first != transition => {
                    return Err(WorkflowError::MixedBatch {
                        certificate_id: id.clone(),
                        expected: first.from,
                        found: record.current_stage,
                    });
                }
                Some(_) => {}
                None => step = Some(transition),
            }
            if let Some(open) = self.open_batch_of(id)? {
                return Err(WorkflowError::BatchConflict {
                    certificate_id: id.clone(),
                    batch_id: open,
                });
            }
            targets.insert(id.clone(), transition.to);
        }

        let batch = Batch {
            id: new_uuid_to_bech32(self.engine.config().batch_hrp())?,
            certificate_ids,
            submitted_by: actor.clone(),
            submitted_at: TimeStamp::new(),
            targets,
        };
        let encoded = to_cbor(&batch)?;

        let result = (&self.batches, &self.open_batches).transaction(|(batches, open)| {
            batches.insert(batch.id.as_bytes(), encoded.as_slice())?;
            for id in &batch.certificate_ids {
                open.insert(id.as_bytes(), batch.id.as_bytes())?;
            }
            Ok::<(), ConflictableTransactionError<WorkflowError>>(())
        });
        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => WorkflowError::Storage(e),
        })?;

        tracing::info!(
            batch = %batch.id,
            members = batch.certificate_ids.len(),
            actor = actor.id(),
            "batch created"
        );
        Ok(batch.id)
    }

    // The still-open batch a certificate belongs to, if any
    fn open_batch_of(&self, certificate_id: &str) -> Result<Option<String>, WorkflowError> {
        let Some(raw) = self.open_batches.get(certificate_id.as_bytes())? else {
            return Ok(None);
        };
        let batch_id = String::from_utf8_lossy(&raw).into_owned();
        let batch = self.load(&batch_id)?;
        if self.is_open_batch(&batch)? {
            Ok(Some(batch_id))
        } else {
            Ok(None)
        }
    }

    fn is_open_batch(&self, batch: &Batch) -> Result<bool, WorkflowError> {
        let ledger = self.engine.ledger();
        for (id, target) in &batch.targets {
            if ledger.read(id)?.current_stage < *target {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_open(&self, batch_id: &str) -> Result<bool, WorkflowError> {
        self.is_open_batch(&self.load(batch_id)?)
    }

    /// Submit every member as the batch's actor. Each member succeeds or fails on its own;
    /// calling this again for a finished batch returns the artifacts it already produced.
    /// A payload for a different step than the batch was created for fails every member.
    pub fn submit_batch(
        &self,
        batch_id: &str,
        payload: &Payload,
    ) -> Result<BatchOutcome, WorkflowError> {
        let batch = self.load(batch_id)?;

        let step = Transition::for_action(batch.submitted_by.role(), payload.action());

        let mut outcome = BTreeMap::new();
        for id in &batch.certificate_ids {
            let result = match step {
                Some(transition) if batch.targets.get(id) == Some(&transition.to) => {
                    self.engine.submit(id, &batch.submitted_by, payload)
                }
                _ => Err(WorkflowError::InvalidPayload {
                    certificate_id: id.clone(),
                    reason: format!("batch {batch_id} does not {}", payload.action()),
                }),
            };
            if let Err(e) = &result {
                tracing::warn!(batch = batch_id, certificate = %id, error = %e, "batch member failed");
            }
            outcome.insert(id.clone(), result);
        }

        let succeeded = outcome.values().filter(|r| r.is_ok()).count();
        tracing::info!(
            batch = batch_id,
            succeeded,
            failed = outcome.len() - succeeded,
            "batch submitted"
        );

        if !self.is_open_batch(&batch)? {
            self.close(&batch)?;
        }

        Ok(outcome)
    }

    // Drop membership entries that still point at this batch
    fn close(&self, batch: &Batch) -> Result<(), WorkflowError> {
        let _membership = self.membership.lock();
        for id in &batch.certificate_ids {
            let _ = self.open_batches.compare_and_swap(
                id.as_bytes(),
                Some(batch.id.as_bytes()),
                None as Option<&[u8]>,
            )?;
        }
        Ok(())
    }

    /// Live stage of every member, read from the ledger.
    pub fn status(&self, batch_id: &str) -> Result<BTreeMap<String, Stage>, WorkflowError> {
        let batch = self.load(batch_id)?;
        let ledger = self.engine.ledger();
        batch
            .certificate_ids
            .iter()
            .map(|id| Ok((id.clone(), ledger.read(id)?.current_stage)))
            .collect()
    }
}
