//! Walks one batch of certificates through issue, both signatures and delivery.
//!
//! Run with `RUST_LOG=debug` to see every transition and handoff.

use cert_workflow::{
    CertificateService, Payload, Role, Stage, WorkflowConfig,
    auth::{Credentials, StaticAuthenticator},
    render::TextRenderer,
    template::{LogoSlot, Template},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const SIGNATURE_AUTH1: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 1];
const SIGNATURE_AUTH2: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 2];

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("certificates"))?);

    let accounts = StaticAuthenticator::new()
        .with_user("admin", "admin123", Role::Issuer)
        .with_user("auth1", "auth123", Role::FirstSigner)
        .with_user("auth2", "auth123", Role::SecondSigner);
    let service = CertificateService::new(db, Arc::new(TextRenderer), WorkflowConfig::default())?
        .with_authenticator(Arc::new(accounts));

    let admin = service.authenticate(&Credentials::new("admin", "admin123"))?;
    let auth1 = service.authenticate(&Credentials::new("auth1", "auth123"))?;
    let auth2 = service.authenticate(&Credentials::new("auth2", "auth123"))?;

    // issuer: assets, template, one certificate per row
    let background = service.upload_asset(&admin, b"landscape background")?;
    let logo = service.upload_asset(&admin, b"institute logo")?;
    let template = Template::new()
        .set_title("Certificate of Completion")
        .set_body("This is to certify that {Name} has successfully completed the {Course} course\nDuration: {From} to {To}")
        .set_background(background)
        .add_logo(LogoSlot::TopLeft, logo)
        .require_field("Name")
        .require_field("Course")
        .require_field("From")
        .require_field("To");
    let template_id = service.register_template(&admin, template)?;

    let rows: Vec<BTreeMap<String, String>> = [("Asha", "AI"), ("Ravi", "Cloud Computing")]
        .iter()
        .map(|(name, course)| {
            BTreeMap::from([
                ("Name".to_string(), name.to_string()),
                ("Course".to_string(), course.to_string()),
                ("From".to_string(), "2024-01-08".to_string()),
                ("To".to_string(), "2024-03-29".to_string()),
            ])
        })
        .collect();

    println!("{}", String::from_utf8_lossy(&service.preview(&template_id, &rows[0])?));

    let ids = service.create_certificates(&admin, &template_id, rows)?;
    let batch = service.create_batch(ids.clone(), &admin)?;
    service.submit_batch(&batch, &Payload::Issue)?;

    // each signer works from their inbox
    for (signer, signature) in [(&auth1, SIGNATURE_AUTH1), (&auth2, SIGNATURE_AUTH2)] {
        let ready: BTreeMap<String, Stage> = service
            .inbox(signer.role())?
            .into_iter()
            .map(|event| (event.certificate_id, event.stage))
            .collect();
        let batch = service.create_batch(ready.keys().cloned(), signer)?;
        for (id, result) in service.submit_batch(&batch, &Payload::sign(signature))? {
            let artifact = result?;
            println!("{} signed {id} -> {}", signer.id(), artifact.reference);
            service.acknowledge(signer.role(), &id, ready[&id])?;
        }
    }

    let batch = service.create_batch(ids.clone(), &admin)?;
    service.submit_batch(&batch, &Payload::Deliver)?;

    for event in service.inbox(Role::Issuer)? {
        if event.stage != Stage::Delivered {
            continue;
        }
        let view = service.get_certificate(&event.certificate_id)?;
        println!("\n{} ({} history entries)", view.record.id, view.history.len());
        if let Some(reference) = event.artifact_ref {
            println!("{}", String::from_utf8_lossy(&service.get_artifact(reference.as_str())?));
        }
    }

    Ok(())
}
