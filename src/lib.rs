//! Multi-party certificate issuance workflow.
//!
//! An issuer drafts certificates from row data and a template, two signers stamp them
//! in order, and the issuer receives the final document. Every document is stored by
//! content hash and every stage change is recorded in a durable, append-only ledger.

pub mod artifact;
pub mod auth;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod ledger;
pub mod render;
pub mod service;
pub mod template;
pub mod types;
pub mod utils;

pub use artifact::{Artifact, ArtifactStore};
pub use config::WorkflowConfig;
pub use engine::{Payload, StageEngine};
pub use error::{ErrorKind, WorkflowError};
pub use service::{CertificateService, CertificateView};
pub use types::{Actor, ArtifactRef, Role, Stage};
