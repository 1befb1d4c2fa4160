//! Property-based tests for stage ordering and artifact storage
//!
//! These drive the engine with arbitrary sequences of actors and payloads, most of
//! which are illegal at the moment they arrive. Whatever gets accepted or rejected,
//! the ledger must keep describing a certificate that walked the stage order one
//! step at a time and never lost a document.
//!
//! Each case opens its own sled database, so case counts are kept low.

use cert_workflow::{
    Actor, ArtifactStore, CertificateService, Payload, Role, Stage, WorkflowConfig,
    render::TextRenderer,
    template::Template,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const SIGNATURE_A: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, b'A'];
const SIGNATURE_B: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, b'B'];

fn actors() -> Vec<Actor> {
    vec![
        Actor::new("admin", Role::Issuer),
        Actor::new("auth1", Role::FirstSigner),
        Actor::new("auth2", Role::SecondSigner),
        Actor::new("intruder", Role::FirstSigner),
    ]
}

fn payloads() -> Vec<Payload> {
    vec![
        Payload::Issue,
        Payload::sign(SIGNATURE_A),
        Payload::sign(SIGNATURE_B),
        Payload::sign(vec![0x00, 0x01]),
        Payload::Deliver,
    ]
}

/// Strategy to generate a sequence of (actor index, payload index) submissions
fn submission_strategy() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..4usize, 0..5usize), 1..=16)
}

fn drafted_certificate() -> anyhow::Result<(TempDir, CertificateService, String)> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("prop.db"))?);
    let service =
        CertificateService::new(db, Arc::new(TextRenderer), WorkflowConfig::default())?;

    let admin = Actor::new("admin", Role::Issuer);
    let background = service.upload_asset(&admin, b"background")?;
    let template = Template::new()
        .set_title("Certificate")
        .set_body("{Name} completed {Course}")
        .set_background(background)
        .require_field("Name")
        .require_field("Course");
    let template_id = service.register_template(&admin, template)?;

    let row = BTreeMap::from([
        ("Name".to_string(), "Asha".to_string()),
        ("Course".to_string(), "AI".to_string()),
    ]);
    let ids = service.create_certificates(&admin, &template_id, vec![row])?;

    Ok((temp_dir, service, ids[0].clone()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: history is always a gap-free, repeat-free prefix of the stage order,
    /// the stage never moves backwards, and recorded documents are never replaced.
    #[test]
    fn prop_history_is_stage_prefix(submissions in submission_strategy()) {
        let (_dir, service, id) = drafted_certificate().unwrap();
        let actors = actors();
        let payloads = payloads();

        let mut last = service.get_certificate(&id).unwrap().record;

        for (actor, payload) in submissions {
            let _ = service.submit(&id, &actors[actor], &payloads[payload]);

            let view = service.get_certificate(&id).unwrap();
            let stages: Vec<Stage> = view.history.iter().map(|entry| entry.stage).collect();
            let expected = &Stage::ALL[..=view.record.current_stage.index()];

            prop_assert_eq!(stages.as_slice(), expected);
            prop_assert!(view.record.current_stage >= last.current_stage);
            prop_assert!(view.record.current_stage.index() <= last.current_stage.index() + 1);
            for (stage, reference) in &last.artifact_refs_by_stage {
                prop_assert_eq!(view.record.artifact_refs_by_stage.get(stage), Some(reference));
            }

            last = view.record;
        }
    }

    /// Property: N accepted submissions in workflow order put the certificate at the Nth
    /// stage, and repeating the last one changes nothing.
    #[test]
    fn prop_n_submissions_reach_nth_stage(steps in 1..=4usize) {
        let (_dir, service, id) = drafted_certificate().unwrap();
        let script = [
            (Actor::new("admin", Role::Issuer), Payload::Issue),
            (Actor::new("auth1", Role::FirstSigner), Payload::sign(SIGNATURE_A)),
            (Actor::new("auth2", Role::SecondSigner), Payload::sign(SIGNATURE_B)),
            (Actor::new("admin", Role::Issuer), Payload::Deliver),
        ];

        let mut last_ref = None;
        for (actor, payload) in &script[..steps] {
            last_ref = Some(service.submit(&id, actor, payload).unwrap().reference);
        }
        prop_assert_eq!(service.get_certificate(&id).unwrap().record.current_stage, Stage::ALL[steps]);

        let (actor, payload) = &script[steps - 1];
        let again = service.submit(&id, actor, payload).unwrap();
        prop_assert_eq!(Some(again.reference), last_ref);
        prop_assert_eq!(service.get_certificate(&id).unwrap().history.len(), steps + 1);
    }

    /// Property: bytes come back out of the artifact store exactly as they went in
    #[test]
    fn prop_artifact_round_trip(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        let temp_dir = tempdir().unwrap();
        let db = sled::open(temp_dir.path().join("artifacts.db")).unwrap();
        let store = ArtifactStore::open(&db).unwrap();

        let reference = store.put(&bytes, Stage::IssuedUnsigned, "admin").unwrap();
        prop_assert_eq!(store.get(&reference).unwrap(), bytes);
    }
}
