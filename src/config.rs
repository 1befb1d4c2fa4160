//! Workflow configuration
use super::render::SignaturePlacement;
use super::types::Stage;

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    certificate_hrp: String,
    batch_hrp: String,
    first_signature: SignaturePlacement,
    second_signature: SignaturePlacement,
    require_jpeg_signatures: bool,
    flush_on_commit: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            certificate_hrp: "cert_".to_string(),
            batch_hrp: "batch_".to_string(),
            first_signature: SignaturePlacement::left(100.0, 160.0),
            second_signature: SignaturePlacement::right(86.0, 160.0),
            require_jpeg_signatures: true,
            flush_on_commit: false,
        }
    }
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_certificate_hrp(mut self, hrp: &str) -> Self {
        self.certificate_hrp = hrp.to_string();
        self
    }
    pub fn set_batch_hrp(mut self, hrp: &str) -> Self {
        self.batch_hrp = hrp.to_string();
        self
    }
    pub fn set_first_signature(mut self, placement: SignaturePlacement) -> Self {
        self.first_signature = placement;
        self
    }
    pub fn set_second_signature(mut self, placement: SignaturePlacement) -> Self {
        self.second_signature = placement;
        self
    }
    pub fn set_require_jpeg_signatures(mut self, require: bool) -> Self {
        self.require_jpeg_signatures = require;
        self
    }
    /// Flush sled after every ledger write instead of relying on its background flusher.
    pub fn set_flush_on_commit(mut self, flush: bool) -> Self {
        self.flush_on_commit = flush;
        self
    }

    pub fn certificate_hrp(&self) -> &str {
        &self.certificate_hrp
    }
    pub fn batch_hrp(&self) -> &str {
        &self.batch_hrp
    }
    pub fn require_jpeg_signatures(&self) -> bool {
        self.require_jpeg_signatures
    }
    pub fn flush_on_commit(&self) -> bool {
        self.flush_on_commit
    }

    /// Where the signature for the transition into `stage` is stamped.
    pub fn placement_for(&self, stage: Stage) -> Option<&SignaturePlacement> {
        match stage {
            Stage::FirstSigned => Some(&self.first_signature),
            Stage::SecondSigned => Some(&self.second_signature),
            _ => None,
        }
    }
}
