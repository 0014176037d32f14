use chrono::{DateTime, Utc};
use keystage_domain::{CredentialMaterial, ExecutionRecord, Operation, Phase, WorkflowState};
use tracing::{info, warn};

use crate::credentials::CredentialSources;
use crate::error::{CredentialError, WorkflowError};

/// Enforces the credential boundary between setup and consume.
///
/// Material whose identity was ever issued for setup is refused for consume,
/// and consume work is only admitted once rotation has happened.
pub struct CredentialRotationGate<'a> {
    sources: &'a CredentialSources,
}

impl<'a> CredentialRotationGate<'a> {
    #[must_use]
    pub const fn new(sources: &'a CredentialSources) -> Self {
        Self { sources }
    }

    /// Issue setup material and record its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error when no setup source is declared or issuance fails.
    pub fn setup_material(
        &self,
        record: &mut ExecutionRecord,
    ) -> Result<CredentialMaterial, CredentialError> {
        let material = self.sources.issue(Phase::Setup)?;
        record.remember_credential(material.fingerprint());
        Ok(material)
    }

    /// Cross the rotation boundary: issue consume material, prove it is fresh,
    /// and move the workflow to `credential_rotated`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::InvalidTransition`] outside the allowed states,
    /// and [`CredentialError::StaleCredentialReuse`] when the issued material
    /// was already used for setup.
    pub fn rotate(
        &self,
        record: &mut ExecutionRecord,
    ) -> Result<CredentialMaterial, WorkflowError> {
        if !matches!(
            record.workflow,
            WorkflowState::SetupApplied
                | WorkflowState::CredentialRotated
                | WorkflowState::ConsumeDestroyed
        ) {
            return Err(WorkflowError::InvalidTransition {
                operation: Operation::Rotate.as_str().to_string(),
                state: record.workflow,
                reason: "setup must be applied before credentials can be rotated".to_string(),
            });
        }

        let material = self.sources.issue(Phase::Consume)?;
        reject_setup_identity(record, &material)?;
        if material.is_expired_at(Utc::now()) {
            return Err(expired(&material).into());
        }

        let fingerprint = material.fingerprint();
        info!(credential = %fingerprint.id, key = %fingerprint.access_key_hint, "rotated credentials for consume");
        record.remember_credential(fingerprint);
        record.workflow = WorkflowState::CredentialRotated;
        Ok(material)
    }

    /// Issue consume material and admit it.
    ///
    /// # Errors
    ///
    /// See [`CredentialRotationGate::admit_consume`].
    pub fn consume_material(
        &self,
        record: &ExecutionRecord,
    ) -> Result<CredentialMaterial, CredentialError> {
        let material = self.sources.issue(Phase::Consume)?;
        Self::admit_consume(record, &material, Utc::now())?;
        Ok(material)
    }

    /// Decide whether `material` may drive consume-phase work.
    ///
    /// Stale reuse is checked before anything else so that setup material is
    /// always named as such, whatever the workflow state.
    ///
    /// # Errors
    ///
    /// Returns `StaleCredentialReuse`, `RotationRequired` or
    /// `CredentialExpired`, in that order of precedence.
    pub fn admit_consume(
        record: &ExecutionRecord,
        material: &CredentialMaterial,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        reject_setup_identity(record, material)?;

        if !record.workflow.is_rotated() {
            return Err(CredentialError::RotationRequired {
                state: record.workflow,
            });
        }

        if material.is_expired_at(now) {
            return Err(expired(material));
        }
        Ok(())
    }
}

fn reject_setup_identity(
    record: &ExecutionRecord,
    material: &CredentialMaterial,
) -> Result<(), CredentialError> {
    if record.credential_ids(Phase::Setup).contains(&material.id) {
        warn!(credential = %material.id, "refusing setup-issued credential for consume");
        return Err(CredentialError::StaleCredentialReuse {
            credential: material.id.clone(),
            phase: Phase::Consume,
        });
    }
    Ok(())
}

fn expired(material: &CredentialMaterial) -> CredentialError {
    CredentialError::CredentialExpired {
        credential: material.id.clone(),
        expired_at: material.expires_at.unwrap_or(material.issued_at),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use chrono::{Duration, Utc};
    use keystage_domain::{ExecutionRecord, Phase, WorkflowState};

    use super::CredentialRotationGate;
    use crate::credentials::{CredentialSources, EphemeralIssuer, StaticIssuer};
    use crate::error::{CredentialError, WorkflowError};

    fn shared_static_sources() -> CredentialSources {
        CredentialSources::default()
            .with_issuer(
                Phase::Setup,
                Box::new(StaticIssuer::new("AKIA1".to_string(), "same".to_string(), None)),
            )
            .with_issuer(
                Phase::Consume,
                Box::new(StaticIssuer::new("AKIA1".to_string(), "same".to_string(), None)),
            )
    }

    fn fresh_sources() -> CredentialSources {
        CredentialSources::default()
            .with_issuer(Phase::Setup, Box::new(EphemeralIssuer))
            .with_issuer(Phase::Consume, Box::new(EphemeralIssuer))
    }

    #[test]
    fn rotation_moves_to_credential_rotated() {
        let sources = fresh_sources();
        let gate = CredentialRotationGate::new(&sources);
        let mut record = ExecutionRecord::default();
        gate.setup_material(&mut record).expect("setup");
        record.workflow = WorkflowState::SetupApplied;

        let material = gate.rotate(&mut record).expect("rotate");
        assert_eq!(record.workflow, WorkflowState::CredentialRotated);
        assert!(record.credential_ids(Phase::Consume).contains(&material.id));
        assert_eq!(record.credentials.len(), 2);
    }

    #[test]
    fn rotation_rejects_setup_identity() {
        let sources = shared_static_sources();
        let gate = CredentialRotationGate::new(&sources);
        let mut record = ExecutionRecord::default();
        gate.setup_material(&mut record).expect("setup");
        record.workflow = WorkflowState::SetupApplied;

        let error = gate.rotate(&mut record).expect_err("stale");
        assert!(matches!(
            error,
            WorkflowError::Credential(CredentialError::StaleCredentialReuse { .. })
        ));
        assert_eq!(record.workflow, WorkflowState::SetupApplied);
    }

    #[test]
    fn rotation_requires_setup() {
        let sources = fresh_sources();
        let gate = CredentialRotationGate::new(&sources);
        let mut record = ExecutionRecord::default();
        let error = gate.rotate(&mut record).expect_err("not applied");
        assert!(matches!(error, WorkflowError::InvalidTransition { .. }));
    }

    #[test]
    fn stale_reuse_takes_precedence_over_missing_rotation() {
        let sources = shared_static_sources();
        let gate = CredentialRotationGate::new(&sources);
        let mut record = ExecutionRecord::default();
        let setup = gate.setup_material(&mut record).expect("setup");
        record.workflow = WorkflowState::SetupApplied;

        let error = CredentialRotationGate::admit_consume(&record, &setup, Utc::now())
            .expect_err("stale");
        assert!(matches!(error, CredentialError::StaleCredentialReuse { .. }));
    }

    #[test]
    fn consume_requires_rotation_then_fresh_unexpired_material() {
        let sources = fresh_sources();
        let gate = CredentialRotationGate::new(&sources);
        let mut record = ExecutionRecord {
            workflow: WorkflowState::SetupApplied,
            ..ExecutionRecord::default()
        };

        let error = gate.consume_material(&record).expect_err("rotation required");
        assert!(matches!(error, CredentialError::RotationRequired { .. }));

        let mut material = gate.rotate(&mut record).expect("rotate");
        CredentialRotationGate::admit_consume(&record, &material, Utc::now()).expect("admit");

        material.expires_at = Some(Utc::now() - Duration::seconds(5));
        let error = CredentialRotationGate::admit_consume(&record, &material, Utc::now())
            .expect_err("expired");
        assert!(matches!(error, CredentialError::CredentialExpired { .. }));
    }
}
