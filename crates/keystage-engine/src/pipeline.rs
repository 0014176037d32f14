use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use keystage_domain::{CredentialSource, ManifestSpec, Phase, PlanReport, WorkflowState};
use tracing::debug;

use crate::credentials::CredentialSources;
use crate::discovery::discover_manifests;
use crate::error::{GraphError, PipelineError};
use crate::graph::ResourceGraph;
use crate::manifest_lua::evaluate_many;
use crate::plan::PlanContext;

/// Every manifest under a path, evaluated.
#[derive(Debug, Clone)]
pub struct LoadedManifests {
    pub manifests: Vec<PathBuf>,
    pub specs: Vec<ManifestSpec>,
    pub warnings: Vec<String>,
    /// Values produced by `secret()`, `env()` and static credential secrets.
    pub sensitive: BTreeSet<String>,
}

impl LoadedManifests {
    /// # Errors
    ///
    /// Returns the first structural problem of the declared graph.
    pub fn graph(&self) -> Result<ResourceGraph, GraphError> {
        ResourceGraph::build(&self.specs)
    }

    #[must_use]
    pub fn credential_sources(&self) -> CredentialSources {
        let declared: Vec<CredentialSource> = self
            .specs
            .iter()
            .flat_map(|spec| spec.credentials.iter().cloned())
            .collect();
        CredentialSources::from_sources(&declared)
    }

    #[must_use]
    pub fn plan_context(&self) -> PlanContext {
        PlanContext {
            manifests: self.manifests.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Discover and evaluate every manifest under `path`.
///
/// # Errors
///
/// Returns an error when discovery or evaluation fails, nothing is found, or
/// two manifests declare a credential source for the same phase.
pub fn load_manifests(path: &Path) -> Result<LoadedManifests, PipelineError> {
    let manifests = discover_manifests(path)?;
    if manifests.is_empty() {
        return Err(PipelineError::NoManifests {
            path: path.to_path_buf(),
        });
    }
    debug!(count = manifests.len(), "evaluating manifests");

    let mut specs = Vec::with_capacity(manifests.len());
    let mut warnings = Vec::new();
    let mut sensitive = BTreeSet::new();
    for evaluated in evaluate_many(&manifests)? {
        specs.push(evaluated.spec);
        warnings.extend(evaluated.warnings);
        sensitive.extend(evaluated.sensitive);
    }

    let mut declared: BTreeMap<Phase, PathBuf> = BTreeMap::new();
    for spec in &specs {
        for source in &spec.credentials {
            if let Some(first) = declared.get(&source.phase) {
                return Err(PipelineError::DuplicateCredentialSource {
                    phase: source.phase,
                    first: first.clone(),
                    second: source.manifest.to_path_buf(),
                });
            }
            declared.insert(source.phase, source.manifest.to_path_buf());
        }
    }

    Ok(LoadedManifests {
        manifests,
        specs,
        warnings,
        sensitive,
    })
}

/// A plan that only carries the graph error, so that plan output stays
/// renderable when the declared graph is broken.
#[must_use]
pub fn unbuildable_plan(
    context: PlanContext,
    workflow: WorkflowState,
    phases: &[Phase],
    error: &GraphError,
) -> PlanReport {
    PlanReport {
        manifests: context.manifests,
        workflow,
        phases: phases.to_vec(),
        execution_order: Vec::new(),
        changes: Vec::new(),
        warnings: context.warnings,
        errors: vec![error.to_string()],
    }
}
