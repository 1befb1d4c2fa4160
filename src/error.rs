use super::render::RendererError;
use super::types::Stage;

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error("Template has no background asset")]
    MissingBackground,
    #[error("Template body is empty")]
    MissingBody,
    #[error("Template declares no fields")]
    EmptySchema,
    #[error("Field '{0}' is declared more than once")]
    DuplicateField(String),
    #[error("Template allows at most 3 logos, got {0}")]
    TooManyLogos(usize),
    #[error("Logo slot {0:?} is used more than once")]
    DuplicateLogoSlot(super::template::LogoSlot),
    #[error("Body placeholder '{{{0}}}' is not a declared field")]
    UndeclaredPlaceholder(String),
    #[error("Body contains an unterminated placeholder")]
    UnterminatedPlaceholder,
}

/// Coarse classification of [`WorkflowError`], stable for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    AlreadyAdvanced,
    StaleTransition,
    EmptyBatch,
    NotFound,
    RendererFailure,
    InvalidInput,
    Conflict,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("Unauthorized: {reason}")]
    Unauthorized {
        certificate_id: Option<String>,
        reason: String,
    },
    #[error("Certificate {certificate_id} has already advanced to {current}")]
    AlreadyAdvanced {
        certificate_id: String,
        current: Stage,
    },
    #[error("Certificate {certificate_id} is at {current}, cannot record {attempted}")]
    StaleTransition {
        certificate_id: String,
        current: Stage,
        attempted: Stage,
    },
    #[error("A batch needs at least one certificate")]
    EmptyBatch,
    #[error("Certificate {0} not found")]
    CertificateNotFound(String),
    #[error("Artifact {0} not found")]
    ArtifactNotFound(String),
    #[error("Template {0} not found")]
    TemplateNotFound(String),
    #[error("Batch {0} not found")]
    BatchNotFound(String),
    #[error("Renderer failed for certificate {certificate_id}: {source}")]
    RendererFailure {
        certificate_id: String,
        #[source]
        source: RendererError,
    },
    #[error("Renderer failed previewing template {template_id}: {source}")]
    PreviewFailure {
        template_id: String,
        #[source]
        source: RendererError,
    },
    #[error("Batch members must all take the same step: {certificate_id} is at {found}, expected {expected}")]
    MixedBatch {
        certificate_id: String,
        expected: Stage,
        found: Stage,
    },
    #[error("Invalid payload for certificate {certificate_id}: {reason}")]
    InvalidPayload {
        certificate_id: String,
        reason: String,
    },
    #[error("Invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),
    #[error("Row {row} is missing field '{field}'")]
    InvalidRow { row: usize, field: String },
    #[error("Certificate {certificate_id} is already in open batch {batch_id}")]
    BatchConflict {
        certificate_id: String,
        batch_id: String,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Codec(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn unauthorized(certificate_id: Option<&str>, reason: impl Into<String>) -> Self {
        WorkflowError::Unauthorized {
            certificate_id: certificate_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Unauthorized { .. } => ErrorKind::Unauthorized,
            WorkflowError::AlreadyAdvanced { .. } => ErrorKind::AlreadyAdvanced,
            WorkflowError::StaleTransition { .. } => ErrorKind::StaleTransition,
            WorkflowError::EmptyBatch => ErrorKind::EmptyBatch,
            WorkflowError::CertificateNotFound(_)
            | WorkflowError::ArtifactNotFound(_)
            | WorkflowError::TemplateNotFound(_)
            | WorkflowError::BatchNotFound(_) => ErrorKind::NotFound,
            WorkflowError::RendererFailure { .. } | WorkflowError::PreviewFailure { .. } => {
                ErrorKind::RendererFailure
            }
            WorkflowError::InvalidPayload { .. }
            | WorkflowError::InvalidTemplate(_)
            | WorkflowError::InvalidRow { .. }
            | WorkflowError::MixedBatch { .. } => ErrorKind::InvalidInput,
            WorkflowError::BatchConflict { .. } => ErrorKind::Conflict,
            WorkflowError::Storage(_) | WorkflowError::Codec(_) | WorkflowError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The certificate the failure refers to, when there is one.
    pub fn certificate_id(&self) -> Option<&str> {
        match self {
            WorkflowError::Unauthorized { certificate_id, .. } => certificate_id.as_deref(),
            WorkflowError::AlreadyAdvanced { certificate_id, .. }
            | WorkflowError::StaleTransition { certificate_id, .. }
            | WorkflowError::RendererFailure { certificate_id, .. }
            | WorkflowError::InvalidPayload { certificate_id, .. }
            | WorkflowError::BatchConflict { certificate_id, .. }
            | WorkflowError::MixedBatch { certificate_id, .. } => Some(certificate_id),
            WorkflowError::CertificateNotFound(id) => Some(id),
            _ => None,
        }
    }

    /// Only renderer failures are worth retrying with the same payload.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::RendererFailure { .. } | WorkflowError::PreviewFailure { .. }
        )
    }
}
