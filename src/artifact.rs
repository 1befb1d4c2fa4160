//! Content-addressed store for immutable document blobs
use super::error::WorkflowError;
use super::types::{ArtifactRef, Stage, TimeStamp};
use super::utils::{from_cbor, to_cbor};
use chrono::Utc;

/// Metadata of a stored blob. The blob itself lives under `bytes_ref` in the `blobs` tree.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    #[n(0)]
    pub reference: ArtifactRef,
    #[n(1)]
    pub stage: Stage,
    #[n(2)]
    pub bytes_ref: String,
    #[n(3)]
    pub produced_by: String,
    #[n(4)]
    pub produced_at: TimeStamp<Utc>,
    #[n(5)]
    pub size: u64,
}

#[derive(Clone)]
pub struct ArtifactStore {
    artifacts: sled::Tree,
    blobs: sled::Tree,
}

impl ArtifactStore {
    pub fn open(db: &sled::Db) -> Result<Self, WorkflowError> {
        Ok(Self {
            artifacts: db.open_tree("artifacts")?,
            blobs: db.open_tree("blobs")?,
        })
    }

    /// Store `bytes` under their content hash. Storing the same bytes again returns the
    /// existing reference and keeps the first metadata.
    pub fn put(
        &self,
        bytes: &[u8],
        stage: Stage,
        produced_by: &str,
    ) -> Result<ArtifactRef, WorkflowError> {
        let reference = ArtifactRef::from_bytes(bytes);
        let key = reference.as_str().as_bytes();

        if self.artifacts.contains_key(key)? {
            tracing::debug!(artifact = %reference, "artifact already stored");
            return Ok(reference);
        }

        // blob first, so visible metadata always has its bytes
        self.blobs.insert(key, bytes)?;

        let artifact = Artifact {
            reference: reference.clone(),
            stage,
            bytes_ref: reference.as_str().to_string(),
            produced_by: produced_by.to_string(),
            produced_at: TimeStamp::new(),
            size: bytes.len() as u64,
        };
        let swapped =
            self.artifacts
                .compare_and_swap(key, None as Option<&[u8]>, Some(to_cbor(&artifact)?))?;

        if swapped.is_ok() {
            tracing::debug!(artifact = %reference, %stage, size = bytes.len(), "artifact stored");
        }

        Ok(reference)
    }

    pub fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, WorkflowError> {
        let artifact = self.artifact(reference)?;
        let blob = self
            .blobs
            .get(artifact.bytes_ref.as_bytes())?
            .ok_or_else(|| WorkflowError::ArtifactNotFound(reference.to_string()))?;
        Ok(blob.to_vec())
    }

    pub fn artifact(&self, reference: &ArtifactRef) -> Result<Artifact, WorkflowError> {
        let raw = self
            .artifacts
            .get(reference.as_str().as_bytes())?
            .ok_or_else(|| WorkflowError::ArtifactNotFound(reference.to_string()))?;
        from_cbor(&raw)
    }

    pub fn contains(&self, reference: &ArtifactRef) -> Result<bool, WorkflowError> {
        Ok(self.artifacts.contains_key(reference.as_str().as_bytes())?)
    }
}
