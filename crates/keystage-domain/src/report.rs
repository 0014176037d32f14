use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{CredentialFingerprint, NodeId, Phase, ResourceKind, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Noop,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub node: NodeId,
    pub kind: ResourceKind,
    pub phase: Phase,
    pub action: PlanAction,
    /// Inputs depend on changes that are only known after apply.
    pub deferred: bool,
    pub dependencies: Vec<NodeId>,
    pub reason: Option<String>,
    pub error: Option<String>,
}

impl PlannedChange {
    #[must_use]
    pub fn would_change(&self) -> bool {
        self.action != PlanAction::Noop
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub manifests: Vec<PathBuf>,
    pub workflow: WorkflowState,
    pub phases: Vec<Phase>,
    pub execution_order: Vec<NodeId>,
    pub changes: Vec<PlannedChange>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl PlanReport {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.changes.iter().any(|change| change.error.is_some())
    }

    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.changes
            .iter()
            .any(|change| change.would_change() || change.error.is_some())
    }

    #[must_use]
    pub fn has_changes_in(&self, phase: Phase) -> bool {
        self.changes
            .iter()
            .any(|change| change.phase == phase && change.would_change())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Rotate,
    Destroy,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Rotate => "rotate",
            Self::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Applied,
    Unchanged,
    Destroyed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node: NodeId,
    pub kind: ResourceKind,
    pub phase: Phase,
    pub outcome: NodeOutcome,
    pub attempts: u32,
    pub blocked_by: Option<NodeId>,
    pub error: Option<String>,
}

impl NodeResult {
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self.outcome,
            NodeOutcome::Failed | NodeOutcome::Skipped | NodeOutcome::Cancelled
        )
    }

    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(self.outcome, NodeOutcome::Applied | NodeOutcome::Destroyed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub operation: Operation,
    pub phases: Vec<Phase>,
    pub workflow_before: WorkflowState,
    pub workflow_after: WorkflowState,
    pub results: Vec<NodeResult>,
    pub credentials: Vec<CredentialFingerprint>,
    pub errors: Vec<String>,
}

impl ApplyReport {
    #[must_use]
    pub const fn new(operation: Operation, workflow: WorkflowState) -> Self {
        Self {
            operation,
            phases: Vec::new(),
            workflow_before: workflow,
            workflow_after: workflow,
            results: Vec::new(),
            credentials: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty() || self.results.iter().any(NodeResult::is_failure)
    }

    #[must_use]
    pub fn result_for(&self, node: &NodeId) -> Option<&NodeResult> {
        self.results.iter().find(|result| &result.node == node)
    }
}
