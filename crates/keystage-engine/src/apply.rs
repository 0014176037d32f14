use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use keystage_domain::{
    ApplyReport, CredentialMaterial, NodeId, NodeOutcome, NodeRecord, NodeResult, Phase,
    ResourceKind, ResourceSpec,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::error::{ProviderError, WorkflowError};
use crate::graph::ResourceGraph;
use crate::plan;
use crate::providers::{ProviderOutputs, ProviderRegistry, ProviderRequest, ResourceProvider};
use crate::resolve::{Outputs, declaration_digest, input_digest, resolve_attributes};
use crate::state::Session;

type ApplyResult<T> = std::result::Result<T, WorkflowError>;

/// Bounded exponential backoff for retryable provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub fail_fast: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            fail_fast: false,
        }
    }
}

/// Drives provider calls for one phase at a time, in dependency waves.
pub struct Executor<'a> {
    providers: &'a ProviderRegistry,
    options: ExecutorOptions,
    cancel: CancelFlag,
}

/// A node ready for a provider call.
struct ApplyTask<'a> {
    spec: &'a ResourceSpec,
    provider: &'a dyn ResourceProvider,
    inputs: Outputs,
    prior_outputs: Option<Outputs>,
    declaration_digest: String,
    input_digest: String,
}

struct DestroyTask<'a> {
    node: NodeId,
    kind: ResourceKind,
    phase: Phase,
    provider: &'a dyn ResourceProvider,
    prior_outputs: Outputs,
}

struct CallOutcome<T> {
    result: std::result::Result<T, ProviderError>,
    attempts: u32,
}

impl<'a> Executor<'a> {
    #[must_use]
    pub const fn new(
        providers: &'a ProviderRegistry,
        options: ExecutorOptions,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            providers,
            options,
            cancel,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Apply every declared node of `phase`, then destroy the phase's orphans.
    ///
    /// Node failures are reported in `report` and never abort independent
    /// branches. Returns whether every node of the phase settled cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that make further progress unsafe:
    /// the record cannot be saved, the lock was lost, or the worker pool
    /// cannot start.
    #[allow(clippy::too_many_lines)]
    pub fn apply_phase(
        &self,
        graph: &ResourceGraph,
        phase: Phase,
        credential: &CredentialMaterial,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> ApplyResult<bool> {
        let nodes = graph.phase_nodes(phase);
        let in_phase: BTreeSet<&NodeId> = nodes.iter().map(|spec| &spec.id).collect();
        info!(%phase, nodes = nodes.len(), "applying phase");

        // Outputs visible to this phase. Same-phase nodes become visible only
        // once they settle in this run.
        let mut visible: BTreeMap<NodeId, Outputs> = session
            .record
            .nodes
            .iter()
            .filter(|(id, _)| !in_phase.contains(id))
            .map(|(id, record)| (id.clone(), record.outputs.clone()))
            .collect();

        let pool = self.pool()?;
        let mut remaining: Vec<&ResourceSpec> = nodes;
        let mut settled: BTreeSet<NodeId> = BTreeSet::new();
        let mut blocked: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut first_failure: Option<NodeId> = None;
        let mut clean = true;

        while !remaining.is_empty() {
            if self.cancel.is_cancelled() {
                for spec in remaining.drain(..) {
                    report.results.push(cancelled(&spec.id, &spec.kind, phase));
                }
                clean = false;
                break;
            }

            if self.options.fail_fast
                && let Some(root) = &first_failure
            {
                for spec in remaining.drain(..) {
                    report.results.push(fail_fast_skip(
                        &spec.id,
                        &spec.kind,
                        phase,
                        root,
                    ));
                }
                break;
            }

            let pending = remaining.len();
            let mut wave: Vec<&ResourceSpec> = Vec::new();
            let mut waiting: Vec<&ResourceSpec> = Vec::new();
            for spec in remaining.drain(..) {
                let same_phase_deps: Vec<&NodeId> = graph
                    .dependencies_of(&spec.id)
                    .into_iter()
                    .filter(|dep| in_phase.contains(dep))
                    .collect();

                if let Some(root) = same_phase_deps.iter().find_map(|dep| blocked.get(*dep)) {
                    let root = root.clone();
                    warn!(node = %spec.id, blocked_by = %root, "skipping node after upstream failure");
                    report.results.push(skipped(&spec.id, &spec.kind, phase, &root));
                    blocked.insert(spec.id.clone(), root);
                    clean = false;
                } else if same_phase_deps.iter().all(|dep| settled.contains(*dep)) {
                    wave.push(spec);
                } else {
                    waiting.push(spec);
                }
            }
            remaining = waiting;

            if wave.is_empty() {
                if remaining.len() == pending {
                    // Nothing can make progress; report instead of spinning.
                    for spec in remaining.drain(..) {
                        let error = WorkflowError::InvalidTransition {
                            operation: "apply".to_string(),
                            state: session.record.workflow,
                            reason: format!("{} has dependencies that never settled", spec.id),
                        };
                        report.results.push(failed(&spec.id, &spec.kind, phase, 0, &error));
                    }
                    clean = false;
                }
                continue;
            }

            let mut tasks: Vec<ApplyTask<'_>> = Vec::new();
            for spec in wave {
                match self.prepare_apply(graph, spec, &visible, session) {
                    Ok(Prepared::Unchanged(outputs)) => {
                        debug!(node = %spec.id, "unchanged");
                        report.results.push(NodeResult {
                            node: spec.id.clone(),
                            kind: spec.kind.clone(),
                            phase,
                            outcome: NodeOutcome::Unchanged,
                            attempts: 0,
                            blocked_by: None,
                            error: None,
                        });
                        visible.insert(spec.id.clone(), outputs);
                        settled.insert(spec.id.clone());
                    }
                    Ok(Prepared::Call(task)) => tasks.push(*task),
                    Err(error) => {
                        warn!(node = %spec.id, %error, "node cannot be applied");
                        report.results.push(failed(&spec.id, &spec.kind, phase, 0, &error));
                        blocked.insert(spec.id.clone(), spec.id.clone());
                        note_failure(&mut first_failure, &spec.id);
                        clean = false;
                    }
                }
            }

            let outcomes: Vec<CallOutcome<ProviderOutputs>> = pool.install(|| {
                tasks
                    .par_iter()
                    .map(|task| self.call_apply(task, credential))
                    .collect()
            });

            for (task, outcome) in tasks.iter().zip(outcomes) {
                let spec = task.spec;
                match outcome.result {
                    Ok(produced) => {
                        info!(node = %spec.id, attempts = outcome.attempts, "applied");
                        session.record.nodes.insert(
                            spec.id.clone(),
                            NodeRecord {
                                kind: spec.kind.clone(),
                                phase,
                                dependencies: spec.dependencies(),
                                declaration_digest: task.declaration_digest.clone(),
                                input_digest: task.input_digest.clone(),
                                outputs: produced.outputs.clone(),
                                sensitive_outputs: produced.sensitive,
                                credential: credential.id.clone(),
                                applied_at: Utc::now(),
                            },
                        );
                        session.checkpoint()?;
                        report.results.push(NodeResult {
                            node: spec.id.clone(),
                            kind: spec.kind.clone(),
                            phase,
                            outcome: NodeOutcome::Applied,
                            attempts: outcome.attempts,
                            blocked_by: None,
                            error: None,
                        });
                        visible.insert(spec.id.clone(), produced.outputs);
                        settled.insert(spec.id.clone());
                    }
                    Err(ProviderError::Cancelled) => {
                        report.results.push(cancelled(&spec.id, &spec.kind, phase));
                        blocked.insert(spec.id.clone(), spec.id.clone());
                        clean = false;
                    }
                    Err(source) => {
                        let error = WorkflowError::ProviderCallFailed {
                            node: spec.id.clone(),
                            source,
                        };
                        warn!(node = %spec.id, attempts = outcome.attempts, %error, "apply failed");
                        report.results.push(failed(
                            &spec.id,
                            &spec.kind,
                            phase,
                            outcome.attempts,
                            &error,
                        ));
                        blocked.insert(spec.id.clone(), spec.id.clone());
                        note_failure(&mut first_failure, &spec.id);
                        clean = false;
                    }
                }
            }
        }

        let orphans = plan::orphans(graph, &session.record, phase);
        if !orphans.is_empty() && !self.cancel.is_cancelled() {
            warn!(%phase, count = orphans.len(), "destroying nodes no longer declared");
            match self.destroy_nodes(&orphans, credential, session, report) {
                Ok(destroyed_cleanly) => clean &= destroyed_cleanly,
                Err(WorkflowError::DependencyStillReferenced { node, dependents }) => {
                    report.errors.push(format!(
                        "orphan {node} was kept: still referenced by {dependents}"
                    ));
                    clean = false;
                }
                Err(error) => return Err(error),
            }
        }

        Ok(clean)
    }

    /// Destroy every recorded node of `phase`.
    ///
    /// # Errors
    ///
    /// See [`Executor::destroy_nodes`].
    pub fn destroy_phase(
        &self,
        phase: Phase,
        credential: &CredentialMaterial,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> ApplyResult<bool> {
        let targets: BTreeSet<NodeId> = session.record.nodes_in_phase(phase).into_iter().collect();
        info!(%phase, nodes = targets.len(), "destroying phase");
        self.destroy_nodes(&targets, credential, session, report)
    }

    /// Destroy `targets` in reverse dependency order, using the recorded edges.
    ///
    /// Returns whether every target was destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::DependencyStillReferenced`] before any provider
    /// call when a recorded node outside `targets` still depends on a target,
    /// and state errors when the record cannot be saved.
    #[allow(clippy::too_many_lines)]
    pub fn destroy_nodes(
        &self,
        targets: &BTreeSet<NodeId>,
        credential: &CredentialMaterial,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> ApplyResult<bool> {
        for target in targets {
            let outside: Vec<String> = session
                .record
                .dependents_of(target)
                .into_iter()
                .filter(|dependent| !targets.contains(dependent))
                .map(String::from)
                .collect();
            if !outside.is_empty() {
                return Err(WorkflowError::DependencyStillReferenced {
                    node: target.clone(),
                    dependents: outside.join(", "),
                });
            }
        }

        let pool = self.pool()?;
        let mut remaining: Vec<NodeId> = targets
            .iter()
            .filter(|id| session.record.nodes.contains_key(*id))
            .cloned()
            .collect();
        let mut blocked: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut first_failure: Option<NodeId> = None;
        let mut clean = true;

        while !remaining.is_empty() {
            if self.cancel.is_cancelled() {
                for id in remaining.drain(..) {
                    let (kind, phase) = recorded_kind(session, &id);
                    report.results.push(cancelled(&id, &kind, phase));
                }
                clean = false;
                break;
            }

            if self.options.fail_fast
                && let Some(root) = &first_failure
            {
                for id in remaining.drain(..) {
                    let (kind, phase) = recorded_kind(session, &id);
                    report
                        .results
                        .push(fail_fast_skip(&id, &kind, phase, root));
                }
                break;
            }

            let pending = remaining.len();
            let mut wave: Vec<NodeId> = Vec::new();
            let mut waiting: Vec<NodeId> = Vec::new();
            for id in remaining.drain(..) {
                let dependents = session.record.dependents_of(&id);
                if let Some(root) = dependents.iter().find_map(|dependent| blocked.get(dependent)) {
                    let root = root.clone();
                    let (kind, phase) = recorded_kind(session, &id);
                    warn!(node = %id, blocked_by = %root, "keeping node whose dependent was not destroyed");
                    report.results.push(skipped(&id, &kind, phase, &root));
                    blocked.insert(id, root);
                    clean = false;
                } else if dependents
                    .iter()
                    .all(|dependent| !session.record.nodes.contains_key(dependent))
                {
                    wave.push(id);
                } else {
                    waiting.push(id);
                }
            }
            remaining = waiting;

            if wave.is_empty() {
                if remaining.len() == pending {
                    for id in remaining.drain(..) {
                        let (kind, phase) = recorded_kind(session, &id);
                        let error = WorkflowError::DependencyStillReferenced {
                            dependents: session
                                .record
                                .dependents_of(&id)
                                .into_iter()
                                .map(String::from)
                                .collect::<Vec<_>>()
                                .join(", "),
                            node: id.clone(),
                        };
                        report.results.push(failed(&id, &kind, phase, 0, &error));
                    }
                    clean = false;
                }
                continue;
            }

            let mut tasks: Vec<DestroyTask<'_>> = Vec::new();
            for id in wave {
                let Some(record) = session.record.nodes.get(&id) else {
                    continue;
                };
                match self.providers.select(&record.kind) {
                    Ok(provider) => tasks.push(DestroyTask {
                        node: id.clone(),
                        kind: record.kind.clone(),
                        phase: record.phase,
                        provider,
                        prior_outputs: record.outputs.clone(),
                    }),
                    Err(source) => {
                        let error = WorkflowError::ProviderCallFailed {
                            node: id.clone(),
                            source,
                        };
                        report
                            .results
                            .push(failed(&id, &record.kind, record.phase, 0, &error));
                        blocked.insert(id.clone(), id.clone());
                        note_failure(&mut first_failure, &id);
                        clean = false;
                    }
                }
            }

            let outcomes: Vec<CallOutcome<()>> = pool.install(|| {
                tasks
                    .par_iter()
                    .map(|task| self.call_destroy(task, credential))
                    .collect()
            });

            for (task, outcome) in tasks.iter().zip(outcomes) {
                match outcome.result {
                    Ok(()) => {
                        info!(node = %task.node, attempts = outcome.attempts, "destroyed");
                        session.record.nodes.remove(&task.node);
                        session.checkpoint()?;
                        report.results.push(NodeResult {
                            node: task.node.clone(),
                            kind: task.kind.clone(),
                            phase: task.phase,
                            outcome: NodeOutcome::Destroyed,
                            attempts: outcome.attempts,
                            blocked_by: None,
                            error: None,
                        });
                    }
                    Err(ProviderError::Cancelled) => {
                        report
                            .results
                            .push(cancelled(&task.node, &task.kind, task.phase));
                        blocked.insert(task.node.clone(), task.node.clone());
                        clean = false;
                    }
                    Err(source) => {
                        let error = WorkflowError::ProviderCallFailed {
                            node: task.node.clone(),
                            source,
                        };
                        warn!(node = %task.node, %error, "destroy failed");
                        report.results.push(failed(
                            &task.node,
                            &task.kind,
                            task.phase,
                            outcome.attempts,
                            &error,
                        ));
                        blocked.insert(task.node.clone(), task.node.clone());
                        note_failure(&mut first_failure, &task.node);
                        clean = false;
                    }
                }
            }
        }

        Ok(clean)
    }

    fn prepare_apply<'s>(
        &'s self,
        graph: &ResourceGraph,
        spec: &'s ResourceSpec,
        visible: &BTreeMap<NodeId, Outputs>,
        session: &Session<'_>,
    ) -> ApplyResult<Prepared<'s>> {
        for dependency in graph.dependencies_of(&spec.id) {
            if !visible.contains_key(dependency) {
                return Err(WorkflowError::DependencyNotApplied {
                    node: spec.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let inputs = resolve_attributes(spec, visible)?;
        let declared = declaration_digest(spec);
        let resolved = input_digest(&inputs);

        let prior = session.record.nodes.get(&spec.id);
        if let Some(prior) = prior
            && prior.declaration_digest == declared
            && prior.input_digest == resolved
        {
            return Ok(Prepared::Unchanged(prior.outputs.clone()));
        }

        let provider = self
            .providers
            .select(&spec.kind)
            .map_err(|source| WorkflowError::ProviderCallFailed {
                node: spec.id.clone(),
                source,
            })?;

        Ok(Prepared::Call(Box::new(ApplyTask {
            spec,
            provider,
            inputs,
            prior_outputs: prior.map(|record| record.outputs.clone()),
            declaration_digest: declared,
            input_digest: resolved,
        })))
    }

    fn call_apply(
        &self,
        task: &ApplyTask<'_>,
        credential: &CredentialMaterial,
    ) -> CallOutcome<ProviderOutputs> {
        let request = ProviderRequest {
            node: &task.spec.id,
            kind: &task.spec.kind,
            phase: task.spec.phase,
            inputs: &task.inputs,
            prior_outputs: task.prior_outputs.as_ref(),
            credential,
        };
        debug!(node = %task.spec.id, provider = task.provider.name(), "applying");
        self.with_retry(&task.spec.id, || task.provider.apply(&request, &self.cancel))
    }

    fn call_destroy(&self, task: &DestroyTask<'_>, credential: &CredentialMaterial) -> CallOutcome<()> {
        let inputs = Outputs::new();
        let request = ProviderRequest {
            node: &task.node,
            kind: &task.kind,
            phase: task.phase,
            inputs: &inputs,
            prior_outputs: Some(&task.prior_outputs),
            credential,
        };
        debug!(node = %task.node, provider = task.provider.name(), "destroying");
        self.with_retry(&task.node, || task.provider.destroy(&request, &self.cancel))
    }

    fn with_retry<T, F>(&self, node: &NodeId, mut call: F) -> CallOutcome<T>
    where
        F: FnMut() -> std::result::Result<T, ProviderError>,
    {
        let retry = self.options.retry;
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return CallOutcome {
                    result: Err(ProviderError::Cancelled),
                    attempts: attempt - 1,
                };
            }
            match call() {
                Err(error) if error.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(%node, attempt, ?delay, %error, "retrying provider call");
                    if !self.cancel.sleep(delay) {
                        return CallOutcome {
                            result: Err(ProviderError::Cancelled),
                            attempts: attempt,
                        };
                    }
                    attempt += 1;
                }
                result => {
                    return CallOutcome {
                        result,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    fn pool(&self) -> ApplyResult<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.concurrency.max(1))
            .build()
            .map_err(|source| WorkflowError::WorkerPool { source })
    }
}

enum Prepared<'a> {
    Unchanged(Outputs),
    Call(Box<ApplyTask<'a>>),
}

fn note_failure(first_failure: &mut Option<NodeId>, node: &NodeId) {
    if first_failure.is_none() {
        *first_failure = Some(node.clone());
    }
}

fn recorded_kind(session: &Session<'_>, id: &NodeId) -> (ResourceKind, Phase) {
    session.record.nodes.get(id).map_or_else(
        || (ResourceKind::Data, Phase::Setup),
        |record| (record.kind.clone(), record.phase),
    )
}

fn failed(
    node: &NodeId,
    kind: &ResourceKind,
    phase: Phase,
    attempts: u32,
    error: &WorkflowError,
) -> NodeResult {
    NodeResult {
        node: node.clone(),
        kind: kind.clone(),
        phase,
        outcome: NodeOutcome::Failed,
        attempts,
        blocked_by: None,
        error: Some(error.to_string()),
    }
}

fn skipped(node: &NodeId, kind: &ResourceKind, phase: Phase, root: &NodeId) -> NodeResult {
    NodeResult {
        node: node.clone(),
        kind: kind.clone(),
        phase,
        outcome: NodeOutcome::Skipped,
        attempts: 0,
        blocked_by: Some(root.clone()),
        error: Some(format!("blocked by failure of {root}")),
    }
}

fn fail_fast_skip(node: &NodeId, kind: &ResourceKind, phase: Phase, root: &NodeId) -> NodeResult {
    NodeResult {
        node: node.clone(),
        kind: kind.clone(),
        phase,
        outcome: NodeOutcome::Skipped,
        attempts: 0,
        blocked_by: Some(root.clone()),
        error: Some(format!("not started: fail-fast after failure of {root}")),
    }
}

fn cancelled(node: &NodeId, kind: &ResourceKind, phase: Phase) -> NodeResult {
    NodeResult {
        node: node.clone(),
        kind: kind.clone(),
        phase,
        outcome: NodeOutcome::Cancelled,
        attempts: 0,
        blocked_by: None,
        error: Some("cancelled".to_string()),
    }
}

#[cfg(test)]
mod tests;
