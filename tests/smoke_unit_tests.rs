//! Smoke Screen Unit tests for certificate workflow components
//!
//! These tests exercise individual components in isolation from the service-level
//! scenarios. They are intended as smoke-screen and generally test the happy-path,
//! plus the one or two rejections each component exists to make.
//!

use cert_workflow::{
    Actor, ArtifactRef, ErrorKind, Payload, Role, Stage, WorkflowConfig, WorkflowError,
    artifact::ArtifactStore,
    auth::{Authenticator, Credentials, StaticAuthenticator},
    engine::{Action, TRANSITIONS, Transition},
    error::TemplateError,
    ledger::{Append, CertificateRecord, Ledger},
    template::{LogoSlot, Template, TemplateStore},
    utils::new_uuid_to_bech32,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// Ids carry their human-readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("cert_").unwrap();
        assert!(encoded.starts_with("cert_1"));
        assert!(encoded.len() > 10);
    }

    /// An empty prefix is not a valid hrp
    #[test]
    fn handles_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    /// Multiple calls generate unique identifiers
    #[test]
    fn generates_unique_ids() {
        let id1 = new_uuid_to_bech32("cert_").unwrap();
        let id2 = new_uuid_to_bech32("cert_").unwrap();
        assert_ne!(id1, id2);
    }
}

// TYPES MODULE TESTS
#[cfg(test)]
mod types_tests {
    use super::*;

    /// Artifact refs are parsed strictly
    #[test]
    fn artifact_ref_parse() {
        let reference = ArtifactRef::from_bytes(b"document");
        assert_eq!(ArtifactRef::parse(reference.as_str()).unwrap(), reference);

        assert!(ArtifactRef::parse("abc").is_err());
        assert!(ArtifactRef::parse(&"A".repeat(64)).is_err());
        assert!(ArtifactRef::parse(&"zz".repeat(32)).is_err());
    }

    /// Handoffs go to whoever acts next, the final document back to the issuer
    #[test]
    fn handoff_recipients() {
        assert_eq!(Stage::Drafted.handoff_recipient(), None);
        assert_eq!(Stage::IssuedUnsigned.handoff_recipient(), Some(Role::FirstSigner));
        assert_eq!(Stage::FirstSigned.handoff_recipient(), Some(Role::SecondSigner));
        assert_eq!(Stage::SecondSigned.handoff_recipient(), Some(Role::Issuer));
        assert_eq!(Stage::Delivered.handoff_recipient(), Some(Role::Issuer));
    }
}

// ENGINE TRANSITION TABLE TESTS
#[cfg(test)]
mod transition_tests {
    use super::*;

    /// The table walks the stage order without gaps
    #[test]
    fn transitions_follow_stage_order() {
        for transition in TRANSITIONS {
            assert_eq!(transition.from.next(), Some(transition.to));
        }
        assert!(Transition::out_of(Stage::Delivered).is_none());
    }

    /// Each role and action pair names exactly one transition
    #[test]
    fn role_and_action_identify_transition() {
        let deliver = Transition::for_action(Role::Issuer, Action::Deliver).unwrap();
        assert_eq!(deliver.from, Stage::SecondSigned);
        assert!(!deliver.produces_artifact());

        let issue = Transition::for_action(Role::Issuer, Action::Issue).unwrap();
        assert_eq!(issue.to, Stage::IssuedUnsigned);

        assert!(Transition::for_action(Role::FirstSigner, Action::Issue).is_none());
    }

    /// Payload digests separate different signatures
    #[test]
    fn payload_digest() {
        let a = Payload::sign(vec![0xFF, 0xD8, 0xFF, 1]).digest().unwrap();
        let b = Payload::sign(vec![0xFF, 0xD8, 0xFF, 2]).digest().unwrap();
        assert_ne!(a, b);
        assert_eq!(Payload::Issue.digest().unwrap(), Payload::Issue.digest().unwrap());
    }
}

// ARTIFACT STORE TESTS
#[cfg(test)]
mod artifact_tests {
    use super::*;

    /// Storing the same bytes twice keeps one artifact and the first metadata
    #[test]
    fn put_is_idempotent() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("artifacts.db"))?;
        let store = ArtifactStore::open(&db)?;

        let first = store.put(b"signed pdf", Stage::FirstSigned, "auth1")?;
        let second = store.put(b"signed pdf", Stage::FirstSigned, "someone-else")?;

        assert_eq!(first, second);
        assert_eq!(store.artifact(&first)?.produced_by, "auth1");
        assert_eq!(store.artifact(&first)?.size, 10);
        assert_eq!(store.get(&first)?, b"signed pdf".to_vec());

        Ok(())
    }

    /// Unknown refs are reported as not found
    #[test]
    fn missing_artifact() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("missing.db"))?;
        let store = ArtifactStore::open(&db)?;

        let err = store.get(&ArtifactRef::from_bytes(b"never stored")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        Ok(())
    }
}

// LEDGER TESTS
#[cfg(test)]
mod ledger_tests {
    use super::*;

    fn drafted(ledger: &Ledger, issuer: &Actor) -> CertificateRecord {
        let record = CertificateRecord::new(
            new_uuid_to_bech32("cert_").unwrap(),
            "template".to_string(),
            BTreeMap::from([("Name".to_string(), "Asha".to_string())]),
            issuer,
        );
        ledger.create(&record, issuer).unwrap();
        record
    }

    /// Appending anything but the next stage fails and leaves the record alone
    #[test]
    fn append_rejects_skipped_stage() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join("ledger.db"))?);
        let ledger = Ledger::open(db, false)?;
        let issuer = Actor::new("admin", Role::Issuer);
        let record = drafted(&ledger, &issuer);

        let skip = Append {
            stage: Stage::FirstSigned,
            artifact_ref: ArtifactRef::from_bytes(b"x"),
            actor: &issuer,
            payload_digest: "digest".to_string(),
            produced_artifact: true,
        };
        let err = ledger.append(&record.id, &skip).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::StaleTransition {
                current: Stage::Drafted,
                attempted: Stage::FirstSigned,
                ..
            }
        ));
        assert_eq!(ledger.read(&record.id)?, record);

        Ok(())
    }

    /// A bulk create that hits an existing id stores none of the records
    #[test]
    fn create_all_is_all_or_nothing() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join("ledger.db"))?);
        let ledger = Ledger::open(db, false)?;
        let issuer = Actor::new("admin", Role::Issuer);
        let existing = drafted(&ledger, &issuer);

        let fresh = CertificateRecord::new(
            new_uuid_to_bech32("cert_")?,
            "template".to_string(),
            BTreeMap::from([("Name".to_string(), "Ravi".to_string())]),
            &issuer,
        );
        let err = ledger
            .create_all(&[fresh.clone(), existing.clone()], &issuer)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyAdvanced { ref certificate_id, .. } if *certificate_id == existing.id));

        assert_eq!(ledger.read(&fresh.id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(ledger.list(None)?, vec![existing.clone()]);
        assert_eq!(ledger.history(&existing.id)?.len(), 1);

        ledger.create_all(&[fresh.clone()], &issuer)?;
        assert_eq!(ledger.read(&fresh.id)?, fresh);

        Ok(())
    }

    /// A valid append updates the record, history and outbox together
    #[test]
    fn append_records_history_and_handoff() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join("ledger.db"))?);
        let ledger = Ledger::open(db, true)?;
        let issuer = Actor::new("admin", Role::Issuer);
        let record = drafted(&ledger, &issuer);

        let issue = Append {
            stage: Stage::IssuedUnsigned,
            artifact_ref: ArtifactRef::from_bytes(b"unsigned"),
            actor: &issuer,
            payload_digest: "digest".to_string(),
            produced_artifact: true,
        };
        let updated = ledger.append(&record.id, &issue)?;
        assert_eq!(updated.current_stage, Stage::IssuedUnsigned);
        assert_eq!(updated.created_at, record.created_at);

        let history = ledger.history(&record.id)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].artifact_ref, None);
        assert_eq!(history[1].artifact_ref, Some(ArtifactRef::from_bytes(b"unsigned")));

        let pending = ledger.pending_handoffs()?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].recipient, Role::FirstSigner);

        // the same append again is now stale
        assert!(ledger.append(&record.id, &issue).is_err());

        assert_eq!(ledger.list(Some(Stage::IssuedUnsigned))?.len(), 1);
        assert!(ledger.list(Some(Stage::Drafted))?.is_empty());

        Ok(())
    }
}

// TEMPLATE TESTS
#[cfg(test)]
mod template_tests {
    use super::*;

    fn base() -> Template {
        Template::new()
            .set_title("Certificate of Completion")
            .set_body("{Name} completed {Course} from {From} to {To}")
            .set_background(ArtifactRef::from_bytes(b"bg"))
            .require_field("Name")
            .require_field("Course")
            .require_field("From")
            .require_field("To")
    }

    /// At most three logos, one per slot
    #[test]
    fn logo_limits() {
        let logo = ArtifactRef::from_bytes(b"logo");
        let three = base()
            .add_logo(LogoSlot::TopLeft, logo.clone())
            .add_logo(LogoSlot::TopCenter, logo.clone())
            .add_logo(LogoSlot::TopRight, logo.clone());
        assert!(three.validate_and_finalise().is_ok());

        let four = three.add_logo(LogoSlot::TopLeft, logo.clone());
        assert!(matches!(
            four.validate_and_finalise(),
            Err(WorkflowError::InvalidTemplate(TemplateError::TooManyLogos(4)))
        ));

        let twice = base()
            .add_logo(LogoSlot::TopRight, logo.clone())
            .add_logo(LogoSlot::TopRight, logo);
        assert!(matches!(
            twice.validate_and_finalise(),
            Err(WorkflowError::InvalidTemplate(TemplateError::DuplicateLogoSlot(LogoSlot::TopRight)))
        ));
    }

    /// A template without a background cannot be finalised
    #[test]
    fn background_required() {
        let template = Template::new().set_body("{Name}").require_field("Name");
        assert!(matches!(
            template.validate_and_finalise(),
            Err(WorkflowError::InvalidTemplate(TemplateError::MissingBackground))
        ));
    }

    /// Blank values count as missing
    #[test]
    fn missing_field_detection() {
        let mut fields = BTreeMap::from([
            ("Name".to_string(), "Asha".to_string()),
            ("Course".to_string(), "AI".to_string()),
            ("From".to_string(), "2024-01-01".to_string()),
            ("To".to_string(), "  ".to_string()),
        ]);
        assert_eq!(base().missing_field(&fields), Some("To"));

        fields.insert("To".to_string(), "2024-06-30".to_string());
        assert_eq!(base().missing_field(&fields), None);
    }

    /// Registered templates round-trip through the store under their hash
    #[test]
    fn store_round_trip() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("templates.db"))?;
        let store = TemplateStore::open(&db)?;

        let id = store.register(&base())?;
        assert_eq!(store.register(&base())?, id);
        assert_eq!(store.load(&id)?, base());
        assert_eq!(store.load("nope").unwrap_err().kind(), ErrorKind::NotFound);

        Ok(())
    }
}

// AUTH TESTS
#[cfg(test)]
mod auth_tests {
    use super::*;

    fn accounts() -> StaticAuthenticator {
        StaticAuthenticator::new()
            .with_user("admin", "admin123", Role::Issuer)
            .with_user("auth1", "auth123", Role::FirstSigner)
            .with_user("auth2", "auth123", Role::SecondSigner)
    }

    /// Valid credentials yield the account's role
    #[test]
    fn authenticates_known_users() {
        let actor = accounts()
            .authenticate(&Credentials::new("auth2", "auth123"))
            .unwrap();
        assert_eq!(actor, Actor::new("auth2", Role::SecondSigner));
    }

    /// Wrong passwords and unknown users are both unauthorized
    #[test]
    fn rejects_bad_credentials() {
        let auth = accounts();
        for credentials in [
            Credentials::new("admin", "auth123"),
            Credentials::new("mallory", "admin123"),
        ] {
            let err = auth.authenticate(&credentials).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthorized);
        }
    }
}

// CONFIG TESTS
#[cfg(test)]
mod config_tests {
    use super::*;
    use cert_workflow::render::{Anchor, SignaturePlacement};

    /// Defaults place the first signature left and the second right
    #[test]
    fn default_placements() {
        let config = WorkflowConfig::default();
        let first = config.placement_for(Stage::FirstSigned).unwrap();
        let second = config.placement_for(Stage::SecondSigned).unwrap();

        assert_eq!(first.anchor, Anchor::Left);
        assert_eq!(second.anchor, Anchor::Right);
        assert!(config.placement_for(Stage::IssuedUnsigned).is_none());
        assert!(config.require_jpeg_signatures());
    }

    /// Setters chain
    #[test]
    fn builder_overrides() {
        let config = WorkflowConfig::new()
            .set_certificate_hrp("diploma_")
            .set_require_jpeg_signatures(false)
            .set_second_signature(SignaturePlacement::right(40.0, 150.0).with_size(100.0, 50.0));

        assert_eq!(config.certificate_hrp(), "diploma_");
        assert!(!config.require_jpeg_signatures());
        assert_eq!(config.placement_for(Stage::SecondSigned).unwrap().width, 100.0);
    }
}
