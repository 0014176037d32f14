use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod credential;
mod record;
mod report;

pub use credential::{CredentialFingerprint, CredentialId, CredentialMaterial};
pub use record::{
    EXECUTION_RECORD_VERSION, ExecutionRecord, LockInfo, NodeRecord, WorkflowState,
};
pub use report::{
    ApplyReport, NodeOutcome, NodeResult, Operation, PlanAction, PlanReport, PlannedChange,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainValidationError {
    #[error("node id must not be empty")]
    EmptyNodeId,
    #[error("node id must not contain whitespace: {id:?}")]
    NodeIdWhitespace { id: String },
    #[error("resource kind must not be empty")]
    EmptyResourceKind,
    #[error("unknown phase \"{value}\" (expected setup, rotate, or consume)")]
    UnknownPhase { value: String },
    #[error("unknown workflow state \"{value}\"")]
    UnknownWorkflowState { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identifier, rejecting blank ids and ids containing whitespace.
    ///
    /// # Errors
    ///
    /// Returns an error when `id` is empty or contains whitespace.
    pub fn new(id: String) -> Result<Self, DomainValidationError> {
        if id.is_empty() {
            return Err(DomainValidationError::EmptyNodeId);
        }
        if id.chars().any(char::is_whitespace) {
            return Err(DomainValidationError::NodeIdWhitespace { id });
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = DomainValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for NodeId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Resource kinds understood by the orchestrator.
///
/// Provider-defined kinds outside the well-known set are carried verbatim in
/// [`ResourceKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceKind {
    AuthMethod,
    Role,
    StaticSecret,
    DynamicSecretProducer,
    CloudResource,
    Data,
    Custom(String),
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthMethod => "auth_method",
            Self::Role => "role",
            Self::StaticSecret => "static_secret",
            Self::DynamicSecretProducer => "dynamic_secret_producer",
            Self::CloudResource => "cloud_resource",
            Self::Data => "data",
            Self::Custom(name) => name,
        }
    }
}

impl FromStr for ResourceKind {
    type Err = DomainValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed {
            "" => Err(DomainValidationError::EmptyResourceKind),
            "auth_method" => Ok(Self::AuthMethod),
            "role" => Ok(Self::Role),
            "static_secret" => Ok(Self::StaticSecret),
            "dynamic_secret_producer" => Ok(Self::DynamicSecretProducer),
            "cloud_resource" => Ok(Self::CloudResource),
            "data" => Ok(Self::Data),
            other => Ok(Self::Custom(other.to_string())),
        }
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKind> for String {
    fn from(value: ResourceKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Ordered workflow phases. `Rotate` is the boundary between the other two and
/// never owns resources.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Setup,
    Rotate,
    Consume,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Rotate => "rotate",
            Self::Consume => "consume",
        }
    }
}

impl FromStr for Phase {
    type Err = DomainValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "setup" => Ok(Self::Setup),
            "rotate" => Ok(Self::Rotate),
            "consume" => Ok(Self::Consume),
            other => Err(DomainValidationError::UnknownPhase {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Reference {
    pub node: NodeId,
    pub attribute: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}", self.node, self.attribute)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Literal(serde_json::Value),
    Reference(Reference),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Collect every reference in this value, depth first.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestPath(PathBuf);

impl ManifestPath {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self(path)
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        self.0.clone()
    }
}

impl From<PathBuf> for ManifestPath {
    fn from(value: PathBuf) -> Self {
        Self::new(value)
    }
}

impl From<&Path> for ManifestPath {
    fn from(value: &Path) -> Self {
        Self::new(value.to_path_buf())
    }
}

impl AsRef<Path> for ManifestPath {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

impl Deref for ManifestPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        self.as_path()
    }
}

impl fmt::Display for ManifestPath {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(formatter)
    }
}

/// One declared resource, as written in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: NodeId,
    pub kind: ResourceKind,
    pub phase: Phase,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub depends_on: Vec<NodeId>,
    pub manifest: ManifestPath,
}

impl ResourceSpec {
    #[must_use]
    pub fn new(id: NodeId, kind: ResourceKind, phase: Phase, manifest: PathBuf) -> Self {
        Self {
            id,
            kind,
            phase,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            manifest: ManifestPath::new(manifest),
        }
    }

    /// References paired with the top-level attribute that carries them.
    #[must_use]
    pub fn references(&self) -> Vec<(&str, &Reference)> {
        let mut out = Vec::new();
        for (name, value) in &self.attributes {
            let mut found = Vec::new();
            value.collect_references(&mut found);
            out.extend(found.into_iter().map(|reference| (name.as_str(), reference)));
        }
        out
    }

    /// Every node this resource depends on, through references or `depends_on`.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<NodeId> {
        self.references()
            .into_iter()
            .map(|(_, reference)| reference.node.clone())
            .chain(self.depends_on.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issuer", rename_all = "snake_case")]
pub enum IssuerSpec {
    Static {
        access_key_id: String,
        #[serde(skip_serializing, default)]
        secret_access_key: String,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    Command {
        binary: String,
        args: Vec<String>,
    },
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSource {
    pub phase: Phase,
    pub issuer: IssuerSpec,
    pub manifest: ManifestPath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    pub path: ManifestPath,
    pub resources: Vec<ResourceSpec>,
    pub credentials: Vec<CredentialSource>,
}

impl ManifestSpec {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self {
            path: ManifestPath::new(path),
            resources: Vec::new(),
            credentials: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use serde_json::json;

    use super::{
        AttributeValue, DomainValidationError, NodeId, Phase, Reference, ResourceKind,
        ResourceSpec,
    };

    fn node(id: &str) -> NodeId {
        NodeId::try_from(id).expect("valid node id")
    }

    #[test]
    fn node_id_rejects_blank_and_whitespace() {
        assert_eq!(
            NodeId::try_from("").expect_err("blank ids must be rejected"),
            DomainValidationError::EmptyNodeId
        );
        assert!(matches!(
            NodeId::try_from("auth admin").expect_err("whitespace must be rejected"),
            DomainValidationError::NodeIdWhitespace { .. }
        ));
        assert_eq!(node("auth/admin").as_str(), "auth/admin");
    }

    #[test]
    fn resource_kind_keeps_unknown_kinds_as_custom() {
        let kind: ResourceKind = "dynamic_secret_producer".parse().expect("kind");
        assert_eq!(kind, ResourceKind::DynamicSecretProducer);

        let custom: ResourceKind = "aws_s3_bucket".parse().expect("kind");
        assert_eq!(custom, ResourceKind::Custom("aws_s3_bucket".to_string()));
        assert_eq!(custom.to_string(), "aws_s3_bucket");

        assert_eq!(
            " ".parse::<ResourceKind>().expect_err("blank kind"),
            DomainValidationError::EmptyResourceKind
        );
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Setup < Phase::Rotate);
        assert!(Phase::Rotate < Phase::Consume);
        assert!("teardown".parse::<Phase>().is_err());
    }

    #[test]
    fn dependencies_include_nested_references_and_depends_on() {
        let mut spec = ResourceSpec::new(
            node("bucket"),
            ResourceKind::CloudResource,
            Phase::Consume,
            PathBuf::from("/tmp/main.lua"),
        );
        let mut nested = BTreeMap::new();
        nested.insert(
            "key".to_string(),
            AttributeValue::Reference(Reference {
                node: node("producer"),
                attribute: "access_key".to_string(),
            }),
        );
        spec.attributes.insert(
            "credentials".to_string(),
            AttributeValue::List(vec![
                AttributeValue::Literal(json!("static")),
                AttributeValue::Map(nested),
            ]),
        );
        spec.depends_on.push(node("auth"));

        let references = spec.references();
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].0, "credentials");

        let deps: Vec<String> = spec
            .dependencies()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(deps, vec!["auth".to_string(), "producer".to_string()]);
    }
}
