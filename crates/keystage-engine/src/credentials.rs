use std::process::Command;

use chrono::{DateTime, Utc};
use keystage_domain::{CredentialId, CredentialMaterial, CredentialSource, IssuerSpec, Phase};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::CredentialError;
use crate::resolve::sha256_bytes;

/// Environment variable naming the phase a command issuer is asked to serve.
pub const ISSUER_PHASE_ENV: &str = "KEYSTAGE_CREDENTIAL_PHASE";

pub trait CredentialIssuer: Send + Sync {
    /// Issue material for `phase`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing source cannot produce a key pair.
    fn issue(&self, phase: Phase) -> Result<CredentialMaterial, CredentialError>;

    /// Short human-readable description, safe to log.
    fn describe(&self) -> String;
}

/// Identity of a key pair. Equal pairs always share an id.
#[must_use]
pub fn credential_id(access_key_id: &str, secret_access_key: &str) -> CredentialId {
    let mut bytes = Vec::with_capacity(access_key_id.len() + secret_access_key.len() + 1);
    bytes.extend_from_slice(access_key_id.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(secret_access_key.as_bytes());
    let digest = sha256_bytes(&bytes);
    CredentialId::new(format!("cred-{}", &digest[..16]))
}

fn material(
    issuer: &str,
    phase: Phase,
    access_key_id: String,
    secret_access_key: String,
    expires_at: Option<DateTime<Utc>>,
) -> Result<CredentialMaterial, CredentialError> {
    if access_key_id.trim().is_empty() || secret_access_key.trim().is_empty() {
        return Err(CredentialError::EmptyMaterial {
            issuer: issuer.to_string(),
        });
    }
    Ok(CredentialMaterial {
        id: credential_id(&access_key_id, &secret_access_key),
        access_key_id,
        secret_access_key,
        phase,
        issued_at: Utc::now(),
        expires_at,
    })
}

/// Fixed key pair taken from the manifest.
#[derive(Clone)]
pub struct StaticIssuer {
    access_key_id: String,
    secret_access_key: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StaticIssuer {
    #[must_use]
    pub fn new(
        access_key_id: String,
        secret_access_key: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            expires_at,
        }
    }
}

impl CredentialIssuer for StaticIssuer {
    fn issue(&self, phase: Phase) -> Result<CredentialMaterial, CredentialError> {
        material(
            &self.describe(),
            phase,
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            self.expires_at,
        )
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Runs an external command that prints
/// `{"access_key_id": …, "secret_access_key": …, "expires_at": …}`.
#[derive(Debug, Clone)]
pub struct CommandIssuer {
    binary: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct IssuedKeyPair {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl CommandIssuer {
    #[must_use]
    pub fn new(binary: String, args: Vec<String>) -> Self {
        Self { binary, args }
    }
}

impl CredentialIssuer for CommandIssuer {
    fn issue(&self, phase: Phase) -> Result<CredentialMaterial, CredentialError> {
        let resolved = which::which(&self.binary).map_err(|_| CredentialError::IssuerMissing {
            binary: self.binary.clone(),
        })?;

        debug!(issuer = %self.binary, %phase, "requesting credential material");
        let output = Command::new(resolved)
            .args(&self.args)
            .env(ISSUER_PHASE_ENV, phase.as_str())
            .output()
            .map_err(|source| CredentialError::IssuerSpawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CredentialError::IssuerFailed {
                binary: self.binary.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let issued: IssuedKeyPair =
            serde_json::from_slice(&output.stdout).map_err(|source| {
                CredentialError::IssuerResponse {
                    binary: self.binary.clone(),
                    source,
                }
            })?;

        material(
            &self.describe(),
            phase,
            issued.access_key_id,
            issued.secret_access_key,
            issued.expires_at,
        )
    }

    fn describe(&self) -> String {
        format!("command:{}", self.binary)
    }
}

/// Locally generated random material. Every call yields a new identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralIssuer;

impl CredentialIssuer for EphemeralIssuer {
    fn issue(&self, phase: Phase) -> Result<CredentialMaterial, CredentialError> {
        let key = Uuid::new_v4().simple().to_string().to_uppercase();
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        material(
            &self.describe(),
            phase,
            format!("KSEPH{}", &key[..16]),
            secret,
            None,
        )
    }

    fn describe(&self) -> String {
        "ephemeral".to_string()
    }
}

#[must_use]
pub fn issuer_for(spec: &IssuerSpec) -> Box<dyn CredentialIssuer> {
    match spec {
        IssuerSpec::Static {
            access_key_id,
            secret_access_key,
            expires_at,
        } => Box::new(StaticIssuer::new(
            access_key_id.clone(),
            secret_access_key.clone(),
            *expires_at,
        )),
        IssuerSpec::Command { binary, args } => {
            Box::new(CommandIssuer::new(binary.clone(), args.clone()))
        }
        IssuerSpec::Ephemeral => Box::new(EphemeralIssuer),
    }
}

/// Declared credential sources, one optional issuer per phase.
#[derive(Default)]
pub struct CredentialSources {
    setup: Option<Box<dyn CredentialIssuer>>,
    consume: Option<Box<dyn CredentialIssuer>>,
}

impl CredentialSources {
    #[must_use]
    pub fn from_sources(sources: &[CredentialSource]) -> Self {
        sources
            .iter()
            .fold(Self::default(), |sources, source| {
                sources.with_issuer(source.phase, issuer_for(&source.issuer))
            })
    }

    /// Replace the issuer for `phase`. Issuers for `rotate` are ignored.
    #[must_use]
    pub fn with_issuer(mut self, phase: Phase, issuer: Box<dyn CredentialIssuer>) -> Self {
        match phase {
            Phase::Setup => self.setup = Some(issuer),
            Phase::Consume => self.consume = Some(issuer),
            Phase::Rotate => {}
        }
        self
    }

    #[must_use]
    pub fn has(&self, phase: Phase) -> bool {
        self.get(phase).is_some()
    }

    /// Issue material from the source declared for `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::MissingSource`] when nothing is declared for
    /// the phase, or the issuer's own error.
    pub fn issue(&self, phase: Phase) -> Result<CredentialMaterial, CredentialError> {
        let issuer = self
            .get(phase)
            .ok_or(CredentialError::MissingSource { phase })?;
        let material = issuer.issue(phase)?;
        debug!(issuer = %issuer.describe(), %phase, credential = %material.id, "issued credential");
        Ok(material)
    }

    fn get(&self, phase: Phase) -> Option<&dyn CredentialIssuer> {
        match phase {
            Phase::Setup => self.setup.as_deref(),
            Phase::Consume => self.consume.as_deref(),
            Phase::Rotate => None,
        }
    }
}
