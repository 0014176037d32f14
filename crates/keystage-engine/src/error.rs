use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use keystage_domain::{CredentialId, NodeId, Phase, Reference, WorkflowState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestEvalError {
    #[error("failed to canonicalize manifest path: {path}")]
    CanonicalizePath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest path has no parent: {path}")]
    MissingManifestParent { path: PathBuf },
    #[error("failed to read manifest: {path}")]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    LuaRuntime {
        path: PathBuf,
        #[source]
        source: mlua::Error,
    },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("manifest path does not exist: {path}")]
    PathDoesNotExist { path: PathBuf },
    #[error("manifest file must end with .lua: {path}")]
    NotAManifest { path: PathBuf },
    #[error("failed while walking manifest directory")]
    Walk {
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to canonicalize manifest path: {path}")]
    CanonicalizePath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle detected: {cycle}")]
    CycleDetected { cycle: String },
    #[error("unresolved reference: {node} ({attribute}) points at undeclared node {target}")]
    UnresolvedReference {
        node: NodeId,
        attribute: String,
        target: NodeId,
    },
    #[error("node {id} is declared twice ({first} and {second})")]
    DuplicateNode {
        id: NodeId,
        first: PathBuf,
        second: PathBuf,
    },
    #[error(
        "{phase} node {node} depends on {dependency_phase} node {dependency}; setup resources cannot depend on consume resources"
    )]
    PhaseInversion {
        node: NodeId,
        phase: Phase,
        dependency: NodeId,
        dependency_phase: Phase,
    },
    #[error("node {node} is declared in the rotate phase, which cannot hold resources")]
    ReservedPhase { node: NodeId },
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("invalid URI: expected scheme://path, got \"{uri}\"")]
    InvalidUri { uri: String },
    #[error("unsupported scheme \"{scheme}\" in secret URI \"{uri}\"")]
    UnsupportedScheme { scheme: String, uri: String },
    #[error("{scheme}:// URI requires {expected}, got \"{uri}\"")]
    InvalidSchemePath {
        scheme: &'static str,
        expected: &'static str,
        uri: String,
    },
    #[error("secret(\"{uri}\") requires the \"{binary}\" CLI to be installed and on PATH")]
    CliMissing { uri: String, binary: &'static str },
    #[error("failed to execute \"{binary}\" ({binary_path}) for secret(\"{uri}\")")]
    CommandSpawn {
        binary: &'static str,
        binary_path: PathBuf,
        uri: String,
        #[source]
        source: io::Error,
    },
    #[error("\"{binary}\" exited with {status}: {stderr}")]
    CommandFailed {
        binary: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("secret(\"{uri}\") reads {name}, which is not set in the current environment")]
    EnvNotSet { uri: String, name: String },
    #[error("secret(\"{uri}\") could not read {path}")]
    ReadFile {
        uri: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("secret(\"{uri}\") resolved to an empty value")]
    EmptyValue { uri: String },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no provider handles resource kind \"{kind}\"")]
    NoProvider { kind: String },
    #[error("plugin \"{plugin}\" requires \"{binary}\" to be installed and on PATH")]
    PluginMissing { plugin: String, binary: String },
    #[error("failed to execute plugin \"{plugin}\"")]
    Spawn {
        plugin: String,
        #[source]
        source: io::Error,
    },
    #[error("plugin \"{plugin}\": {context}")]
    Io {
        plugin: String,
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode request for plugin \"{plugin}\"")]
    EncodeRequest {
        plugin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("plugin \"{plugin}\" returned malformed output")]
    InvalidResponse {
        plugin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("plugin \"{plugin}\" exited with {status}: {stderr}")]
    Failed {
        plugin: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("provider \"{provider}\" reported a transient failure: {message}")]
    Transient { provider: String, message: String },
    #[error("provider \"{provider}\" rejected the request: {message}")]
    Rejected { provider: String, message: String },
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether a retry of the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(
        "stale credential reuse: credential {credential} was issued for setup and cannot be used for {phase}"
    )]
    StaleCredentialReuse { credential: CredentialId, phase: Phase },
    #[error("credential rotation required before consume (workflow state: {state})")]
    RotationRequired { state: WorkflowState },
    #[error("credential {credential} expired at {expired_at}")]
    CredentialExpired {
        credential: CredentialId,
        expired_at: DateTime<Utc>,
    },
    #[error("no credential source declared for phase {phase}; add credential(\"{phase}\", {{...}}) to a manifest")]
    MissingSource { phase: Phase },
    #[error("credential issuer requires \"{binary}\" to be installed and on PATH")]
    IssuerMissing { binary: String },
    #[error("failed to execute credential issuer \"{binary}\"")]
    IssuerSpawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("credential issuer \"{binary}\" exited with {status}: {stderr}")]
    IssuerFailed {
        binary: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("credential issuer \"{binary}\" returned malformed output")]
    IssuerResponse {
        binary: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("credential issuer {issuer} produced an empty key pair")]
    EmptyMaterial { issuer: String },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read execution record {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode execution record {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode execution record")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write execution record {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to replace execution record {path}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
    #[error("execution record {path} has format version {found}; this build supports {expected}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error(
        "concurrent execution conflict: state is locked by {owner} for {operation} (lock {lock_id}, expires {expires_at})"
    )]
    ConcurrentExecutionConflict {
        lock_id: String,
        owner: String,
        operation: String,
        expires_at: DateTime<Utc>,
    },
    #[error("lock {lock_id} is not held on this execution record")]
    LockNotHeld { lock_id: String },
    #[error("lock time-to-live of {seconds}s is out of range")]
    LockTtlOutOfRange { seconds: i64 },
    #[error("failed to access lock file {path}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode lock file {path}")]
    LockDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("provider call failed for node {node}: {source}")]
    ProviderCallFailed {
        node: NodeId,
        #[source]
        source: ProviderError,
    },
    #[error("node {node} references {reference}, but that output was not produced")]
    MissingOutput { node: NodeId, reference: Reference },
    #[error("node {node} depends on {dependency}, which has not been applied")]
    DependencyNotApplied { node: NodeId, dependency: NodeId },
    #[error("cannot destroy {node}: still referenced by {dependents}")]
    DependencyStillReferenced { node: NodeId, dependents: String },
    #[error("cannot {operation} while workflow is {state}: {reason}")]
    InvalidTransition {
        operation: String,
        state: WorkflowState,
        reason: String,
    },
    #[error("failed to start worker pool")]
    WorkerPool {
        #[source]
        source: rayon::ThreadPoolBuildError,
    },
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("no manifests found under {path} (expected files ending with .lua)")]
    NoManifests { path: PathBuf },
    #[error(transparent)]
    ManifestEval(#[from] ManifestEvalError),
    #[error("credential source for {phase} is declared in both {first} and {second}")]
    DuplicateCredentialSource {
        phase: Phase,
        first: PathBuf,
        second: PathBuf,
    },
}
