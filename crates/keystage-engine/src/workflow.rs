use std::fmt;
use std::str::FromStr;

use chrono::{Duration, Utc};
use keystage_domain::{
    ApplyReport, CredentialMaterial, ExecutionRecord, NodeOutcome, NodeResult, Operation, Phase,
    PlanReport, WorkflowState,
};
use tracing::{info, warn};

use crate::apply::Executor;
use crate::credentials::CredentialSources;
use crate::error::{StateError, WorkflowError};
use crate::gate::CredentialRotationGate;
use crate::graph::ResourceGraph;
use crate::plan::{PlanContext, build_destroy_plan, build_plan};
use crate::state::{Session, StateStore};

type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

pub const DEFAULT_LOCK_TTL_SECS: i64 = 900;

/// Which phases an operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseSelection {
    Setup,
    Consume,
    #[default]
    All,
}

impl PhaseSelection {
    /// Phases in apply order.
    #[must_use]
    pub const fn phases(self) -> &'static [Phase] {
        match self {
            Self::Setup => &[Phase::Setup],
            Self::Consume => &[Phase::Consume],
            Self::All => &[Phase::Setup, Phase::Consume],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Consume => "consume",
            Self::All => "all",
        }
    }
}

impl FromStr for PhaseSelection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "setup" => Ok(Self::Setup),
            "consume" => Ok(Self::Consume),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown phase \"{other}\" (expected setup, consume or all)"
            )),
        }
    }
}

impl fmt::Display for PhaseSelection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Runs plan, apply, rotate and destroy against one execution record.
///
/// Every mutating operation holds the state lock for its whole duration and
/// persists the record after each node. Node-level failures are reported in
/// the returned [`ApplyReport`]; policy violations are returned as errors.
pub struct Workflow<'a> {
    graph: &'a ResourceGraph,
    credentials: &'a CredentialSources,
    store: &'a dyn StateStore,
    executor: Executor<'a>,
    lock_ttl: Duration,
}

impl<'a> Workflow<'a> {
    #[must_use]
    pub fn new(
        graph: &'a ResourceGraph,
        credentials: &'a CredentialSources,
        store: &'a dyn StateStore,
        executor: Executor<'a>,
    ) -> Self {
        Self {
            graph,
            credentials,
            store,
            executor,
            lock_ttl: Duration::seconds(DEFAULT_LOCK_TTL_SECS),
        }
    }

    #[must_use]
    pub const fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// Compare the declared graph against the record without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be loaded.
    pub fn plan(
        &self,
        selection: PhaseSelection,
        destroy: bool,
        context: PlanContext,
    ) -> WorkflowResult<PlanReport> {
        let record = self.store.load()?;
        let report = if destroy {
            build_destroy_plan(&record, selection.phases(), context)
        } else {
            build_plan(self.graph, &record, selection.phases(), context)
        };
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns an error when the lock is held elsewhere, the state machine
    /// refuses the transition, or a credential is rejected by the gate.
    pub fn apply(&self, selection: PhaseSelection) -> WorkflowResult<ApplyReport> {
        let mut session = self.open(Operation::Apply, selection)?;
        let mut report = ApplyReport::new(Operation::Apply, session.record.workflow);

        match selection {
            PhaseSelection::Setup => {
                self.apply_setup(&mut session, &mut report)?;
            }
            PhaseSelection::Consume => {
                let material = self.admitted_consume_material(&mut session.record)?;
                self.apply_consume(&material, &mut session, &mut report)?;
            }
            PhaseSelection::All => {
                if self.apply_setup(&mut session, &mut report)? {
                    // Setup material was dropped with the setup scope above.
                    let material = if session.record.workflow.is_rotated() {
                        self.admitted_consume_material(&mut session.record)?
                    } else {
                        self.rotate_in(&mut session, &mut report)?
                    };
                    self.apply_consume(&material, &mut session, &mut report)?;
                } else {
                    warn!("setup did not settle cleanly; consume was not started");
                }
            }
        }

        self.finish(session, report)
    }

    /// Issue consume credentials and cross the rotation boundary.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` before setup is applied and
    /// `StaleCredentialReuse` when the consume source hands back a setup
    /// identity.
    pub fn rotate(&self) -> WorkflowResult<ApplyReport> {
        let mut session = Session::open(self.store, Operation::Rotate.as_str(), self.lock_ttl)?;
        let mut report = ApplyReport::new(Operation::Rotate, session.record.workflow);
        report.phases.push(Phase::Rotate);
        self.rotate_in(&mut session, &mut report)?;
        self.finish(session, report)
    }

    /// # Errors
    ///
    /// Returns `DependencyStillReferenced` or `InvalidTransition` when setup
    /// would be destroyed underneath consume nodes, and gate errors for the
    /// consume credential.
    pub fn destroy(&self, selection: PhaseSelection) -> WorkflowResult<ApplyReport> {
        let mut session = self.open(Operation::Destroy, selection)?;
        let mut report = ApplyReport::new(Operation::Destroy, session.record.workflow);

        match selection {
            PhaseSelection::Setup => {
                self.destroy_setup(&mut session, &mut report)?;
            }
            PhaseSelection::Consume => {
                self.destroy_consume(&mut session, &mut report)?;
            }
            PhaseSelection::All => {
                if self.destroy_consume(&mut session, &mut report)? {
                    self.destroy_setup(&mut session, &mut report)?;
                } else {
                    warn!("consume was not fully destroyed; setup was kept");
                }
            }
        }

        self.finish(session, report)
    }

    fn open(&self, operation: Operation, selection: PhaseSelection) -> WorkflowResult<Session<'a>> {
        let label = format!("{} {selection}", operation.as_str());
        Ok(Session::open(self.store, &label, self.lock_ttl)?)
    }

    /// Returns whether setup settled cleanly.
    fn apply_setup(
        &self,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> WorkflowResult<bool> {
        report.phases.push(Phase::Setup);
        let state = session.record.workflow;

        if !matches!(
            state,
            WorkflowState::Uninitialized | WorkflowState::SetupApplied
        ) {
            return self.verify_setup_unchanged(&session.record, report);
        }

        let has_work = !self.graph.phase_nodes(Phase::Setup).is_empty()
            || !session.record.nodes_in_phase(Phase::Setup).is_empty();
        let clean = if has_work {
            let gate = CredentialRotationGate::new(self.credentials);
            let material = gate.setup_material(&mut session.record)?;
            report.credentials.push(material.fingerprint());
            self.executor
                .apply_phase(self.graph, Phase::Setup, &material, session, report)?
        } else {
            true
        };

        if clean {
            session.record.workflow = WorkflowState::SetupApplied;
        }
        session.checkpoint()?;
        Ok(clean)
    }

    /// Past `setup_applied`, setup may only be re-applied when nothing would
    /// change.
    fn verify_setup_unchanged(
        &self,
        record: &ExecutionRecord,
        report: &mut ApplyReport,
    ) -> WorkflowResult<bool> {
        let plan = build_plan(self.graph, record, &[Phase::Setup], PlanContext::default());
        if plan.has_drift() {
            let pending: Vec<&str> = plan
                .changes
                .iter()
                .filter(|change| change.would_change())
                .map(|change| change.node.as_str())
                .collect();
            return Err(WorkflowError::InvalidTransition {
                operation: "apply setup".to_string(),
                state: record.workflow,
                reason: format!(
                    "setup has pending changes ({}); destroy consume and setup first",
                    pending.join(", ")
                ),
            });
        }

        for change in plan.changes {
            report.results.push(NodeResult {
                node: change.node,
                kind: change.kind,
                phase: change.phase,
                outcome: NodeOutcome::Unchanged,
                attempts: 0,
                blocked_by: None,
                error: None,
            });
        }
        Ok(true)
    }

    fn rotate_in(
        &self,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> WorkflowResult<CredentialMaterial> {
        if !report.phases.contains(&Phase::Rotate) {
            report.phases.push(Phase::Rotate);
        }
        let gate = CredentialRotationGate::new(self.credentials);
        let material = gate.rotate(&mut session.record)?;
        report.credentials.push(material.fingerprint());
        session.checkpoint()?;
        Ok(material)
    }

    fn admitted_consume_material(
        &self,
        record: &mut ExecutionRecord,
    ) -> WorkflowResult<CredentialMaterial> {
        let gate = CredentialRotationGate::new(self.credentials);
        let material = gate.consume_material(record)?;
        record.remember_credential(material.fingerprint());
        Ok(material)
    }

    fn apply_consume(
        &self,
        material: &CredentialMaterial,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> WorkflowResult<bool> {
        report.phases.push(Phase::Consume);
        CredentialRotationGate::admit_consume(&session.record, material, Utc::now())?;
        if !report.credentials.iter().any(|known| known.id == material.id) {
            report.credentials.push(material.fingerprint());
        }

        let clean =
            self.executor
                .apply_phase(self.graph, Phase::Consume, material, session, report)?;
        if clean {
            session.record.workflow = WorkflowState::ConsumeApplied;
        }
        session.checkpoint()?;
        Ok(clean)
    }

    fn destroy_consume(
        &self,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> WorkflowResult<bool> {
        report.phases.push(Phase::Consume);
        let state = session.record.workflow;
        let recorded = session.record.nodes_in_phase(Phase::Consume);
        if recorded.is_empty() && !state.is_rotated() {
            info!(%state, "no consume nodes recorded");
            return Ok(true);
        }

        let material = self.admitted_consume_material(&mut session.record)?;
        report.credentials.push(material.fingerprint());
        let clean = self
            .executor
            .destroy_phase(Phase::Consume, &material, session, report)?;
        if clean {
            session.record.workflow = WorkflowState::ConsumeDestroyed;
        }
        session.checkpoint()?;
        Ok(clean)
    }

    fn destroy_setup(
        &self,
        session: &mut Session<'_>,
        report: &mut ApplyReport,
    ) -> WorkflowResult<bool> {
        report.phases.push(Phase::Setup);
        let setup = session.record.nodes_in_phase(Phase::Setup);
        for node in &setup {
            let dependents: Vec<String> = session
                .record
                .dependents_of(node)
                .into_iter()
                .filter(|dependent| {
                    session
                        .record
                        .nodes
                        .get(dependent)
                        .is_some_and(|record| record.phase == Phase::Consume)
                })
                .map(String::from)
                .collect();
            if !dependents.is_empty() {
                return Err(WorkflowError::DependencyStillReferenced {
                    node: node.clone(),
                    dependents: dependents.join(", "),
                });
            }
        }

        let consume = session.record.nodes_in_phase(Phase::Consume);
        if !consume.is_empty() {
            return Err(WorkflowError::InvalidTransition {
                operation: "destroy setup".to_string(),
                state: session.record.workflow,
                reason: format!(
                    "{} consume node(s) still recorded; destroy consume first",
                    consume.len()
                ),
            });
        }

        let clean = if setup.is_empty() {
            true
        } else {
            let gate = CredentialRotationGate::new(self.credentials);
            let material = gate.setup_material(&mut session.record)?;
            report.credentials.push(material.fingerprint());
            self.executor
                .destroy_phase(Phase::Setup, &material, session, report)?
        };

        if clean {
            // Credential fingerprints survive so that setup identities stay
            // barred from consume on this record.
            session.record.workflow = WorkflowState::Uninitialized;
            session.record.nodes.clear();
        }
        session.checkpoint()?;
        Ok(clean)
    }

    fn finish(&self, session: Session<'_>, mut report: ApplyReport) -> WorkflowResult<ApplyReport> {
        if self.executor.is_cancelled() {
            report.errors.push(WorkflowError::Cancelled.to_string());
        }
        let record = session.close()?;
        report.workflow_after = record.workflow;
        info!(
            operation = report.operation.as_str(),
            before = %report.workflow_before,
            after = %report.workflow_after,
            "operation finished"
        );
        Ok(report)
    }
}

/// Force-release a lock left behind by an interrupted run.
///
/// # Errors
///
/// Returns [`StateError::LockNotHeld`] unless `lock_id` names the current lock.
pub fn unlock(store: &dyn StateStore, lock_id: &str) -> Result<(), StateError> {
    store.force_unlock(lock_id)?;
    info!(lock = lock_id, "state lock released");
    Ok(())
}
