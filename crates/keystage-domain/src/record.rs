use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CredentialFingerprint, CredentialId, DomainValidationError, NodeId, Phase, ResourceKind,
};

pub const EXECUTION_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Uninitialized,
    SetupApplied,
    CredentialRotated,
    ConsumeApplied,
    ConsumeDestroyed,
}

impl WorkflowState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::SetupApplied => "setup_applied",
            Self::CredentialRotated => "credential_rotated",
            Self::ConsumeApplied => "consume_applied",
            Self::ConsumeDestroyed => "consume_destroyed",
        }
    }

    /// Whether the rotation boundary has been crossed.
    #[must_use]
    pub const fn is_rotated(self) -> bool {
        matches!(self, Self::CredentialRotated | Self::ConsumeApplied)
    }
}

impl FromStr for WorkflowState {
    type Err = DomainValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "uninitialized" => Ok(Self::Uninitialized),
            "setup_applied" => Ok(Self::SetupApplied),
            "credential_rotated" => Ok(Self::CredentialRotated),
            "consume_applied" => Ok(Self::ConsumeApplied),
            "consume_destroyed" => Ok(Self::ConsumeDestroyed),
            other => Err(DomainValidationError::UnknownWorkflowState {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: ResourceKind,
    pub phase: Phase,
    pub dependencies: BTreeSet<NodeId>,
    pub declaration_digest: String,
    pub input_digest: String,
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub sensitive_outputs: BTreeSet<String>,
    pub credential: CredentialId,
    pub applied_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Values of outputs the provider flagged as sensitive, rendered as text.
    #[must_use]
    pub fn sensitive_values(&self) -> BTreeSet<String> {
        self.sensitive_outputs
            .iter()
            .filter_map(|name| self.outputs.get(name))
            .filter_map(|value| match value {
                serde_json::Value::String(text) => Some(text.clone()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect()
    }
}

/// Durable record of what has been applied, keyed by node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub version: u32,
    pub serial: u64,
    pub workflow: WorkflowState,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    pub credentials: Vec<CredentialFingerprint>,
}

impl Default for ExecutionRecord {
    fn default() -> Self {
        Self {
            version: EXECUTION_RECORD_VERSION,
            serial: 0,
            workflow: WorkflowState::Uninitialized,
            nodes: BTreeMap::new(),
            credentials: Vec::new(),
        }
    }
}

impl ExecutionRecord {
    /// Recorded nodes whose dependencies include `node`.
    #[must_use]
    pub fn dependents_of(&self, node: &NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, record)| record.dependencies.contains(node))
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn nodes_in_phase(&self, phase: Phase) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, record)| record.phase == phase)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Identities of every credential issued for `phase`.
    #[must_use]
    pub fn credential_ids(&self, phase: Phase) -> BTreeSet<CredentialId> {
        self.credentials
            .iter()
            .filter(|fingerprint| fingerprint.phase == phase)
            .map(|fingerprint| fingerprint.id.clone())
            .collect()
    }

    /// Append a fingerprint unless the same identity is already recorded for
    /// the same phase.
    pub fn remember_credential(&mut self, fingerprint: CredentialFingerprint) {
        let known = self
            .credentials
            .iter()
            .any(|existing| existing.id == fingerprint.id && existing.phase == fingerprint.phase);
        if !known {
            self.credentials.push(fingerprint);
        }
    }

    #[must_use]
    pub fn sensitive_values(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .flat_map(NodeRecord::sensitive_values)
            .collect()
    }
}

/// Advisory lock held over an execution record while a workflow runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub owner: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
