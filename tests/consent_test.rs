//! Consent lifecycle against the ledger

mod common;

use compliance_core::consent::{Acknowledgment, ConsentStatus};
use compliance_core::error::{ComplianceError, ValidationError};
use compliance_core::ledger::{EventType, LedgerFilter};
use serde_json::json;

#[tokio::test]
async fn test_revoke_requires_obtained() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    let consent = &h.state.consent;
    consent
        .register_template("clinic-a", "treatment", "Consent to treatment", true, "admin")
        .await?;

    let pending = consent.request("clinic-a", "p-a1", "treatment", "nurse-1").await?;
    assert_eq!(pending.status, ConsentStatus::Pending);
    let err = consent.revoke(pending.id, "changed mind", "p-a1").await.unwrap_err();
    assert!(matches!(
        err,
        ComplianceError::InvalidTransition {
            current: ConsentStatus::Pending,
            requested: ConsentStatus::Revoked
        }
    ));

    let refused = consent
        .refuse("clinic-a", "p-a2", "treatment", "nurse-1", "declined at intake")
        .await?;
    let err = consent.revoke(refused.id, "n/a", "p-a2").await.unwrap_err();
    assert!(matches!(
        err,
        ComplianceError::InvalidTransition {
            current: ConsentStatus::Refused,
            ..
        }
    ));

    // Failed transitions leave no trace in the audit trail.
    assert_eq!(consent.history(pending.id).await?.len(), 1);
    assert_eq!(consent.history(refused.id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_revocation_reopens_required_gap() -> Result<(), Box<dyn std::error::Error>> {
    println!("🧪 Testing consent revocation...");
    let h = common::setup().await;
    let consent = &h.state.consent;
    let template = consent
        .register_template("clinic-a", "treatment", "Consent to treatment", true, "admin")
        .await?;
    consent
        .register_template("clinic-a", "newsletter", "Marketing newsletter", false, "admin")
        .await?;

    let missing = consent.missing_required("clinic-a", "p-a1").await?;
    assert_eq!(missing.iter().map(|t| t.id).collect::<Vec<_>>(), vec![template.id]);

    let obtained = consent
        .obtain(
            "clinic-a",
            "p-a1",
            "treatment",
            "nurse-1",
            Acknowledgment::complete(),
            Some(json!({ "method": "tablet", "strokes": 3 })),
        )
        .await?;
    assert_eq!(obtained.status, ConsentStatus::Obtained);
    assert!(obtained.obtained_at.is_some());
    assert!(consent.missing_required("clinic-a", "p-a1").await?.is_empty());
    println!("✅ Obtained consent closes the gap");

    let revoked = consent.revoke(obtained.id, "patient request", "p-a1").await?;
    assert_eq!(revoked.status, ConsentStatus::Revoked);
    assert_eq!(revoked.revocation_reason.as_deref(), Some("patient request"));
    let missing = consent.missing_required("clinic-a", "p-a1").await?;
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].consent_type, "treatment");
    println!("✅ Revocation reopens the gap");

    let history = consent.history(obtained.id).await?;
    let statuses: Vec<_> = history.iter().map(|a| a.new_status).collect();
    assert_eq!(statuses, vec![ConsentStatus::Obtained, ConsentStatus::Revoked]);
    assert_eq!(history[1].previous_status, Some(ConsentStatus::Obtained));
    assert!(history[0].ledger_sequence_no < history[1].ledger_sequence_no);

    // A revoked consent can be obtained again as a fresh record.
    let again = consent
        .obtain("clinic-a", "p-a1", "treatment", "nurse-2", Acknowledgment::complete(), None)
        .await?;
    assert_ne!(again.id, obtained.id);
    assert!(consent.missing_required("clinic-a", "p-a1").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_consent_changes_are_chained() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    let consent = &h.state.consent;
    consent
        .register_template("clinic-a", "treatment", "Consent to treatment", true, "admin")
        .await?;
    let pending = consent.request("clinic-a", "p-a1", "treatment", "nurse-1").await?;
    let obtained = consent
        .obtain("clinic-a", "p-a1", "treatment", "nurse-1", Acknowledgment::complete(), None)
        .await?;
    assert_eq!(pending.id, obtained.id);

    let entries = h
        .state
        .ledger
        .read(
            "clinic-a",
            &LedgerFilter::default()
                .event_type(EventType::DataModification)
                .resource("consent", Some(obtained.id.to_string())),
        )
        .await?;
    assert_eq!(entries.len(), 2);
    let last = entries[1].new_value.as_ref().ok_or("missing payload")?;
    assert_eq!(last["status"], "obtained");
    assert_eq!(last["patient_id"], "p-a1");

    for audit in consent.history(obtained.id).await? {
        assert!(entries.iter().any(|e| e.sequence_no == audit.ledger_sequence_no));
    }
    assert!(h.state.ledger.verify_chain("clinic-a", None, None).await?.is_valid);
    Ok(())
}

#[tokio::test]
async fn test_acknowledgment_and_template_rules() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    let consent = &h.state.consent;

    // No active template for this type.
    let err = consent
        .obtain("clinic-a", "p-a1", "research", "nurse-1", Acknowledgment::complete(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ComplianceError::NotFound(_)));

    consent
        .register_template("clinic-a", "research", "Research participation", false, "admin")
        .await?;
    let partial = Acknowledgment {
        scroll_completed: true,
        checkbox_confirmed: false,
    };
    let err = consent
        .obtain("clinic-a", "p-a1", "research", "nurse-1", partial, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ComplianceError::Validation(ValidationError::IncompleteAcknowledgment)
    ));
    assert!(consent.current("clinic-a", "p-a1", "research").await?.is_none());

    let err = consent
        .refuse("clinic-a", "p-a1", "research", "nurse-1", "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, ComplianceError::Validation(ValidationError::MissingReason)));

    // New versions supersede the old one for new records.
    let v2 = consent
        .register_template("clinic-a", "research", "Research participation (2026)", false, "admin")
        .await?;
    assert_eq!(v2.version, 2);
    let record = consent
        .obtain("clinic-a", "p-a1", "research", "nurse-1", Acknowledgment::complete(), None)
        .await?;
    assert_eq!(record.template_id, v2.id);
    Ok(())
}
