use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use keystage_domain::{
    ExecutionRecord, NodeId, Phase, PlanAction, PlanReport, PlannedChange, ResourceSpec,
    WorkflowState,
};

use crate::graph::ResourceGraph;
use crate::resolve::{Outputs, declaration_digest, input_digest, resolve_attributes};

/// Inputs shared by apply and destroy planning.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub manifests: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Compare declared resources of `phases` against the record.
///
/// Pure: no provider is called. Changes whose inputs depend on other pending
/// changes are marked `deferred`.
#[must_use]
pub fn build_plan(
    graph: &ResourceGraph,
    record: &ExecutionRecord,
    phases: &[Phase],
    context: PlanContext,
) -> PlanReport {
    let mut changes = Vec::new();
    let mut pending: BTreeSet<NodeId> = BTreeSet::new();
    let mut execution_order = Vec::new();

    // Recorded outputs of nodes that will not change; pending nodes are
    // deliberately absent so that their dependents resolve as deferred.
    let mut known: BTreeMap<NodeId, Outputs> = record
        .nodes
        .iter()
        .map(|(id, node)| (id.clone(), node.outputs.clone()))
        .collect();

    for spec in graph.ordered().filter(|spec| phases.contains(&spec.phase)) {
        execution_order.push(spec.id.clone());
        let change = plan_node(graph, spec, record, &known, &pending);
        if change.would_change() {
            pending.insert(spec.id.clone());
            known.remove(&spec.id);
        }
        changes.push(change);
    }

    for phase in phases {
        for orphan in destroy_order(record, &orphans(graph, record, *phase)) {
            changes.push(destroy_change(record, &orphan, "no longer declared"));
        }
    }

    let mut report = PlanReport {
        manifests: context.manifests,
        workflow: record.workflow,
        phases: phases.to_vec(),
        execution_order,
        changes,
        warnings: context.warnings,
        errors: Vec::new(),
    };
    check_transitions(&mut report);
    report
}

/// Plan the destruction of every recorded node of `phases`, dependents first.
#[must_use]
pub fn build_destroy_plan(
    record: &ExecutionRecord,
    phases: &[Phase],
    context: PlanContext,
) -> PlanReport {
    let targets: BTreeSet<NodeId> = phases
        .iter()
        .flat_map(|phase| record.nodes_in_phase(*phase))
        .collect();
    let order = destroy_order(record, &targets);

    let mut errors = Vec::new();
    for target in &targets {
        let outside: Vec<String> = record
            .dependents_of(target)
            .into_iter()
            .filter(|dependent| !targets.contains(dependent))
            .map(String::from)
            .collect();
        if !outside.is_empty() {
            errors.push(format!(
                "cannot destroy {target}: still referenced by {}",
                outside.join(", ")
            ));
        }
    }

    PlanReport {
        manifests: context.manifests,
        workflow: record.workflow,
        phases: phases.to_vec(),
        execution_order: order.clone(),
        changes: order
            .iter()
            .map(|id| destroy_change(record, id, "destroy requested"))
            .collect(),
        warnings: context.warnings,
        errors,
    }
}

/// Recorded nodes of `phase` that are no longer declared.
#[must_use]
pub fn orphans(graph: &ResourceGraph, record: &ExecutionRecord, phase: Phase) -> BTreeSet<NodeId> {
    record
        .nodes_in_phase(phase)
        .into_iter()
        .filter(|id| !graph.contains(id))
        .collect()
}

/// Order `targets` so that every node comes before the nodes it depends on.
#[must_use]
pub fn destroy_order(record: &ExecutionRecord, targets: &BTreeSet<NodeId>) -> Vec<NodeId> {
    // Count, per target, the dependents that must go first.
    let mut waiting_on: BTreeMap<&NodeId, usize> = targets
        .iter()
        .map(|id| {
            let count = record
                .dependents_of(id)
                .iter()
                .filter(|dependent| targets.contains(*dependent))
                .count();
            (id, count)
        })
        .collect();

    let mut ready: BTreeSet<&NodeId> = waiting_on
        .iter()
        .filter_map(|(id, count)| (*count == 0).then_some(*id))
        .collect();
    let mut order = Vec::with_capacity(targets.len());

    while let Some(next) = ready.pop_first() {
        order.push(next.clone());
        let Some(node) = record.nodes.get(next) else {
            continue;
        };
        for dependency in &node.dependencies {
            if let Some(count) = waiting_on.get_mut(dependency) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(dependency);
                }
            }
        }
    }

    // A corrupted record could hold a cycle; keep every target in the output.
    for target in targets {
        if !order.contains(target) {
            order.push(target.clone());
        }
    }
    order
}

fn plan_node(
    graph: &ResourceGraph,
    spec: &ResourceSpec,
    record: &ExecutionRecord,
    known: &BTreeMap<NodeId, Outputs>,
    pending: &BTreeSet<NodeId>,
) -> PlannedChange {
    let dependencies: Vec<NodeId> = graph
        .dependencies_of(&spec.id)
        .into_iter()
        .cloned()
        .collect();
    let pending_deps: Vec<&NodeId> = dependencies
        .iter()
        .filter(|dep| pending.contains(*dep) || !record.nodes.contains_key(*dep))
        .collect();
    let deferred = !pending_deps.is_empty();

    let mut change = PlannedChange {
        node: spec.id.clone(),
        kind: spec.kind.clone(),
        phase: spec.phase,
        action: PlanAction::Noop,
        deferred,
        dependencies: dependencies.clone(),
        reason: None,
        error: None,
    };

    let Some(prior) = record.nodes.get(&spec.id) else {
        change.action = PlanAction::Create;
        change.reason = Some(if deferred {
            format!("new node; inputs known after {}", join_ids(&pending_deps))
        } else {
            "new node".to_string()
        });
        return change;
    };

    if prior.declaration_digest != declaration_digest(spec) {
        change.action = PlanAction::Update;
        change.reason = Some("declaration changed".to_string());
        return change;
    }

    if deferred {
        change.action = PlanAction::Update;
        change.reason = Some(format!(
            "inputs may change after {}",
            join_ids(&pending_deps)
        ));
        return change;
    }

    match resolve_attributes(spec, known) {
        Ok(inputs) if input_digest(&inputs) == prior.input_digest => {}
        Ok(_) => {
            change.action = PlanAction::Update;
            change.reason = Some("upstream outputs changed".to_string());
        }
        Err(error) => {
            change.action = PlanAction::Update;
            change.error = Some(error.to_string());
        }
    }
    change
}

fn destroy_change(record: &ExecutionRecord, id: &NodeId, reason: &str) -> PlannedChange {
    let node = record.nodes.get(id);
    PlannedChange {
        node: id.clone(),
        kind: node.map_or(keystage_domain::ResourceKind::Data, |node| node.kind.clone()),
        phase: node.map_or(Phase::Setup, |node| node.phase),
        action: PlanAction::Destroy,
        deferred: false,
        dependencies: node
            .map(|node| node.dependencies.iter().cloned().collect())
            .unwrap_or_default(),
        reason: Some(reason.to_string()),
        error: None,
    }
}

/// Flag changes the workflow state machine would refuse.
fn check_transitions(report: &mut PlanReport) {
    let state = report.workflow;
    if report.has_changes_in(Phase::Setup)
        && !matches!(
            state,
            WorkflowState::Uninitialized | WorkflowState::SetupApplied
        )
    {
        report.errors.push(format!(
            "setup has pending changes but the workflow is {state}; destroy consume before changing setup"
        ));
    }

    if report.phases.contains(&Phase::Consume)
        && report.has_changes_in(Phase::Consume)
        && !state.is_rotated()
        && !report.phases.contains(&Phase::Setup)
    {
        report.warnings.push(format!(
            "consume changes require credential rotation first (workflow is {state}); run rotate"
        ));
    }
}

fn join_ids(ids: &[&NodeId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
