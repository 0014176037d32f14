mod apply;
mod cancel;
mod config;
mod credentials;
mod discovery;
mod error;
mod gate;
mod graph;
mod manifest_lua;
mod pipeline;
mod plan;
mod providers;
mod resolve;
mod secrets;
mod state;
mod workflow;

pub use apply::{Executor, ExecutorOptions, RetryPolicy};
pub use cancel::CancelFlag;
pub use config::{
    CONFIG_FILE_NAME, Config, LogConfig, LogFormat, PluginConfig, RetryConfig, config_candidates,
    load_config,
};
pub use credentials::{
    CommandIssuer, CredentialIssuer, CredentialSources, EphemeralIssuer, ISSUER_PHASE_ENV,
    StaticIssuer, credential_id, issuer_for,
};
pub use discovery::{discover_manifests, manifest_root};
pub use error::{
    ConfigError, CredentialError, DiscoveryError, GraphError, ManifestEvalError, PipelineError,
    ProviderError, SecretError, StateError, WorkflowError,
};
pub use gate::CredentialRotationGate;
pub use graph::ResourceGraph;
pub use manifest_lua::{EvaluatedManifest, evaluate_manifest, evaluate_many};
pub use pipeline::{LoadedManifests, load_manifests, unbuildable_plan};
pub use plan::{PlanContext, build_destroy_plan, build_plan, destroy_order, orphans};
pub use providers::{
    DataProvider, ExecProvider, ProviderOutputs, ProviderRegistry, ProviderRequest,
    ResourceProvider, TRANSIENT_EXIT_CODE,
};
pub use resolve::{Outputs, declaration_digest, input_digest, resolve_attributes};
pub use secrets::{SecretSource, parse_secret_uri, resolve_secret};
pub use state::{FileStateStore, LockGuard, Session, StateStore};
pub use workflow::{DEFAULT_LOCK_TTL_SECS, PhaseSelection, Workflow, unlock};
