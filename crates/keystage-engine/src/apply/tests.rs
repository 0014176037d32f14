#![allow(clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use keystage_domain::{
    ApplyReport, AttributeValue, CredentialId, CredentialMaterial, NodeId, NodeOutcome, Operation,
    Phase, Reference, ResourceKind, ResourceSpec, WorkflowState,
};
use serde_json::json;

use super::{Executor, ExecutorOptions, RetryPolicy};
use crate::cancel::CancelFlag;
use crate::error::{ProviderError, WorkflowError};
use crate::graph::ResourceGraph;
use crate::providers::{ProviderOutputs, ProviderRegistry, ProviderRequest, ResourceProvider};
use crate::state::{FileStateStore, Session, StateStore};

#[derive(Default)]
struct Script {
    calls: Vec<String>,
    failing: Vec<String>,
    transient: BTreeMap<String, u32>,
}

#[derive(Clone, Default)]
struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
    cancel_during: Option<(String, CancelFlag)>,
}

impl ScriptedProvider {
    fn failing(self, node: &str) -> Self {
        self.script
            .lock()
            .expect("lock")
            .failing
            .push(node.to_string());
        self
    }

    fn transient(self, node: &str, times: u32) -> Self {
        self.script
            .lock()
            .expect("lock")
            .transient
            .insert(node.to_string(), times);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.script.lock().expect("lock").calls.clone()
    }

    fn outcome(&self, action: &str, node: &NodeId) -> Result<(), ProviderError> {
        if let Some((target, flag)) = &self.cancel_during
            && target == node.as_str()
        {
            flag.cancel();
            return Err(ProviderError::Cancelled);
        }

        let mut script = self.script.lock().expect("lock");
        script.calls.push(format!("{action}:{node}"));
        if script.failing.iter().any(|failing| failing == node.as_str()) {
            return Err(ProviderError::Rejected {
                provider: "scripted".to_string(),
                message: format!("{node} refused"),
            });
        }
        if let Some(remaining) = script.transient.get_mut(node.as_str())
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::Transient {
                provider: "scripted".to_string(),
                message: "throttled".to_string(),
            });
        }
        Ok(())
    }
}

impl ResourceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, kind: &ResourceKind) -> bool {
        *kind == widget()
    }

    fn apply(
        &self,
        request: &ProviderRequest<'_>,
        _cancel: &CancelFlag,
    ) -> Result<ProviderOutputs, ProviderError> {
        self.outcome("apply", request.node)?;
        let mut outputs = request.inputs.clone();
        outputs.insert("arn".to_string(), json!(format!("arn:{}", request.node)));
        outputs.insert("token".to_string(), json!(format!("tok-{}", request.node)));
        Ok(ProviderOutputs {
            outputs,
            sensitive: ["token".to_string()].into(),
        })
    }

    fn destroy(
        &self,
        request: &ProviderRequest<'_>,
        _cancel: &CancelFlag,
    ) -> Result<(), ProviderError> {
        self.outcome("destroy", request.node)
    }
}

fn widget() -> ResourceKind {
    ResourceKind::Custom("widget".to_string())
}

fn node(id: &str) -> NodeId {
    NodeId::try_from(id).expect("valid node id")
}

fn spec(id: &str, phase: Phase) -> ResourceSpec {
    let mut spec = ResourceSpec::new(node(id), widget(), phase, PathBuf::from("/tmp/main.lua"));
    spec.attributes
        .insert("name".to_string(), AttributeValue::Literal(json!(id)));
    spec
}

fn referencing(id: &str, phase: Phase, target: &str) -> ResourceSpec {
    let mut spec = spec(id, phase);
    spec.attributes.insert(
        "upstream".to_string(),
        AttributeValue::Reference(Reference {
            node: node(target),
            attribute: "arn".to_string(),
        }),
    );
    spec
}

fn credential(phase: Phase) -> CredentialMaterial {
    CredentialMaterial {
        id: CredentialId::new(format!("cred-{phase}")),
        access_key_id: "AKIATEST".to_string(),
        secret_access_key: "secret".to_string(),
        phase,
        issued_at: Utc::now(),
        expires_at: None,
    }
}

fn options() -> ExecutorOptions {
    ExecutorOptions {
        concurrency: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        fail_fast: false,
    }
}

fn store() -> (tempfile::TempDir, FileStateStore) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileStateStore::new(temp.path().join("state.json"));
    (temp, store)
}

fn apply(
    provider: &ScriptedProvider,
    store: &FileStateStore,
    resources: Vec<ResourceSpec>,
    phase: Phase,
    cancel: CancelFlag,
) -> (bool, ApplyReport) {
    let graph = ResourceGraph::from_resources(resources).expect("graph");
    let registry = ProviderRegistry::from_providers(vec![Box::new(provider.clone())]);
    let executor = Executor::new(&registry, options(), cancel);
    let mut session =
        Session::open(store, "apply", chrono::Duration::minutes(5)).expect("session");
    let mut report = ApplyReport::new(Operation::Apply, session.record.workflow);
    let clean = executor
        .apply_phase(&graph, phase, &credential(phase), &mut session, &mut report)
        .expect("apply phase");
    session.close().expect("close");
    (clean, report)
}

fn outcome(report: &ApplyReport, id: &str) -> NodeOutcome {
    report
        .result_for(&node(id))
        .map(|result| result.outcome)
        .expect("result present")
}

#[test]
fn applies_dependencies_first_and_records_outputs() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    let resources = vec![
        referencing("c", Phase::Setup, "b"),
        referencing("b", Phase::Setup, "a"),
        spec("a", Phase::Setup),
    ];

    let (clean, report) = apply(&provider, &store, resources, Phase::Setup, CancelFlag::new());
    assert!(clean);
    assert_eq!(provider.calls(), vec!["apply:a", "apply:b", "apply:c"]);
    assert_eq!(outcome(&report, "c"), NodeOutcome::Applied);

    let record = store.load().expect("load");
    assert_eq!(record.nodes.len(), 3);
    assert_eq!(record.serial, 3);
    let c = &record.nodes[&node("c")];
    assert_eq!(c.outputs["upstream"], json!("arn:b"));
    assert!(c.sensitive_outputs.contains("token"));
    assert_eq!(c.credential, CredentialId::new("cred-setup".to_string()));
}

#[test]
fn reapply_without_changes_makes_no_calls() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    let resources = || vec![spec("a", Phase::Setup), referencing("b", Phase::Setup, "a")];

    apply(&provider, &store, resources(), Phase::Setup, CancelFlag::new());
    let serial = store.load().expect("load").serial;

    let (clean, report) = apply(&provider, &store, resources(), Phase::Setup, CancelFlag::new());
    assert!(clean);
    assert_eq!(provider.calls().len(), 2);
    assert!(
        report
            .results
            .iter()
            .all(|result| result.outcome == NodeOutcome::Unchanged)
    );
    assert_eq!(store.load().expect("load").serial, serial);
}

#[test]
fn upstream_change_reapplies_dependents() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    apply(
        &provider,
        &store,
        vec![spec("a", Phase::Setup), referencing("b", Phase::Setup, "a")],
        Phase::Setup,
        CancelFlag::new(),
    );

    // The provider derives `arn` from the node id, so change what `b` reads.
    let mut a = spec("a", Phase::Setup);
    a.attributes
        .insert("name".to_string(), AttributeValue::Literal(json!("renamed")));
    let mut b = spec("b", Phase::Setup);
    b.attributes.insert(
        "upstream".to_string(),
        AttributeValue::Reference(Reference {
            node: node("a"),
            attribute: "name".to_string(),
        }),
    );

    let (_, report) = apply(&provider, &store, vec![a, b], Phase::Setup, CancelFlag::new());
    assert_eq!(outcome(&report, "a"), NodeOutcome::Applied);
    assert_eq!(outcome(&report, "b"), NodeOutcome::Applied);
    let record = store.load().expect("load");
    assert_eq!(record.nodes[&node("b")].outputs["upstream"], json!("renamed"));
}

#[test]
fn failure_skips_dependents_and_keeps_independent_branches() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default().failing("a");
    let resources = vec![
        spec("a", Phase::Setup),
        referencing("b", Phase::Setup, "a"),
        referencing("c", Phase::Setup, "b"),
        spec("solo", Phase::Setup),
    ];

    let (clean, report) = apply(&provider, &store, resources, Phase::Setup, CancelFlag::new());
    assert!(!clean);
    assert_eq!(outcome(&report, "a"), NodeOutcome::Failed);
    assert_eq!(outcome(&report, "solo"), NodeOutcome::Applied);

    let c = report.result_for(&node("c")).expect("c result");
    assert_eq!(c.outcome, NodeOutcome::Skipped);
    assert_eq!(c.blocked_by, Some(node("a")));

    let error = report
        .result_for(&node("a"))
        .and_then(|result| result.error.clone())
        .expect("error text");
    assert!(error.contains("provider call failed for node a"), "unexpected: {error}");

    let record = store.load().expect("load");
    assert!(record.nodes.contains_key(&node("solo")));
    assert!(!record.nodes.contains_key(&node("a")));
    assert!(!provider.calls().contains(&"apply:b".to_string()));
}

#[test]
fn transient_failures_are_retried() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default().transient("a", 2);

    let (clean, report) = apply(
        &provider,
        &store,
        vec![spec("a", Phase::Setup)],
        Phase::Setup,
        CancelFlag::new(),
    );
    assert!(clean);
    let result = report.result_for(&node("a")).expect("result");
    assert_eq!(result.outcome, NodeOutcome::Applied);
    assert_eq!(result.attempts, 3);
}

#[test]
fn retries_stop_at_max_attempts() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default().transient("a", 10);

    let (clean, report) = apply(
        &provider,
        &store,
        vec![spec("a", Phase::Setup)],
        Phase::Setup,
        CancelFlag::new(),
    );
    assert!(!clean);
    let result = report.result_for(&node("a")).expect("result");
    assert_eq!(result.outcome, NodeOutcome::Failed);
    assert_eq!(result.attempts, 3);
}

#[test]
fn cancellation_marks_pending_nodes_and_records_nothing_for_them() {
    let (_temp, store) = store();
    let cancel = CancelFlag::new();
    let provider = ScriptedProvider {
        cancel_during: Some(("a".to_string(), cancel.clone())),
        ..ScriptedProvider::default()
    };

    let (clean, report) = apply(
        &provider,
        &store,
        vec![spec("a", Phase::Setup), referencing("b", Phase::Setup, "a")],
        Phase::Setup,
        cancel,
    );
    assert!(!clean);
    assert_eq!(outcome(&report, "a"), NodeOutcome::Cancelled);
    assert!(report.result_for(&node("b")).is_some_and(|result| result.is_failure()));
    assert!(store.load().expect("load").nodes.is_empty());
}

#[test]
fn fail_fast_stops_scheduling_new_waves() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default().failing("a");
    let graph = ResourceGraph::from_resources(vec![
        spec("a", Phase::Setup),
        spec("b", Phase::Setup),
        referencing("z", Phase::Setup, "b"),
    ])
    .expect("graph");
    let registry = ProviderRegistry::from_providers(vec![Box::new(provider.clone())]);
    let executor = Executor::new(
        &registry,
        ExecutorOptions {
            fail_fast: true,
            ..options()
        },
        CancelFlag::new(),
    );
    let mut session = Session::open(&store, "apply", chrono::Duration::minutes(5)).expect("open");
    let mut report = ApplyReport::new(Operation::Apply, WorkflowState::Uninitialized);
    let clean = executor
        .apply_phase(
            &graph,
            Phase::Setup,
            &credential(Phase::Setup),
            &mut session,
            &mut report,
        )
        .expect("apply");
    assert!(!clean);
    let z = report.result_for(&node("z")).expect("z result");
    assert_eq!(z.outcome, NodeOutcome::Skipped);
    assert!(!provider.calls().contains(&"apply:z".to_string()));
}

#[test]
fn destroy_runs_in_reverse_dependency_order() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    apply(
        &provider,
        &store,
        vec![
            spec("a", Phase::Setup),
            referencing("b", Phase::Setup, "a"),
            referencing("c", Phase::Setup, "b"),
        ],
        Phase::Setup,
        CancelFlag::new(),
    );

    let registry = ProviderRegistry::from_providers(vec![Box::new(provider.clone())]);
    let executor = Executor::new(&registry, options(), CancelFlag::new());
    let mut session = Session::open(&store, "destroy", chrono::Duration::minutes(5)).expect("open");
    let mut report = ApplyReport::new(Operation::Destroy, session.record.workflow);
    let clean = executor
        .destroy_phase(
            Phase::Setup,
            &credential(Phase::Setup),
            &mut session,
            &mut report,
        )
        .expect("destroy");
    session.close().expect("close");

    assert!(clean);
    let destroys: Vec<String> = provider
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("destroy:"))
        .collect();
    assert_eq!(destroys, vec!["destroy:c", "destroy:b", "destroy:a"]);
    assert!(store.load().expect("load").nodes.is_empty());
}

#[test]
fn destroy_rejects_targets_still_referenced() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    apply(
        &provider,
        &store,
        vec![spec("a", Phase::Setup), referencing("b", Phase::Setup, "a")],
        Phase::Setup,
        CancelFlag::new(),
    );

    let registry = ProviderRegistry::from_providers(vec![Box::new(provider.clone())]);
    let executor = Executor::new(&registry, options(), CancelFlag::new());
    let mut session = Session::open(&store, "destroy", chrono::Duration::minutes(5)).expect("open");
    let mut report = ApplyReport::new(Operation::Destroy, session.record.workflow);
    let error = executor
        .destroy_nodes(
            &[node("a")].into(),
            &credential(Phase::Setup),
            &mut session,
            &mut report,
        )
        .expect_err("still referenced");
    assert!(matches!(
        error,
        WorkflowError::DependencyStillReferenced { .. }
    ));
    assert!(error.to_string().contains('b'));
    assert!(!provider.calls().iter().any(|call| call.starts_with("destroy:")));
}

#[test]
fn failed_destroy_keeps_dependencies() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    apply(
        &provider,
        &store,
        vec![spec("a", Phase::Setup), referencing("b", Phase::Setup, "a")],
        Phase::Setup,
        CancelFlag::new(),
    );

    let provider = provider.failing("b");
    let registry = ProviderRegistry::from_providers(vec![Box::new(provider.clone())]);
    let executor = Executor::new(&registry, options(), CancelFlag::new());
    let mut session = Session::open(&store, "destroy", chrono::Duration::minutes(5)).expect("open");
    let mut report = ApplyReport::new(Operation::Destroy, session.record.workflow);
    let clean = executor
        .destroy_phase(
            Phase::Setup,
            &credential(Phase::Setup),
            &mut session,
            &mut report,
        )
        .expect("destroy");
    session.close().expect("close");

    assert!(!clean);
    assert_eq!(outcome(&report, "b"), NodeOutcome::Failed);
    let a = report.result_for(&node("a")).expect("a result");
    assert_eq!(a.outcome, NodeOutcome::Skipped);
    assert_eq!(a.blocked_by, Some(node("b")));
    assert_eq!(store.load().expect("load").nodes.len(), 2);
}

#[test]
fn orphans_are_destroyed_after_applies() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    apply(
        &provider,
        &store,
        vec![spec("keep", Phase::Setup), spec("gone", Phase::Setup)],
        Phase::Setup,
        CancelFlag::new(),
    );

    let (clean, report) = apply(
        &provider,
        &store,
        vec![spec("keep", Phase::Setup)],
        Phase::Setup,
        CancelFlag::new(),
    );
    assert!(clean);
    assert_eq!(outcome(&report, "gone"), NodeOutcome::Destroyed);
    let record = store.load().expect("load");
    assert!(record.nodes.contains_key(&node("keep")));
    assert!(!record.nodes.contains_key(&node("gone")));
}

#[test]
fn consume_nodes_read_setup_outputs_from_the_record() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    let resources = || {
        vec![
            spec("role", Phase::Setup),
            referencing("bucket", Phase::Consume, "role"),
        ]
    };
    apply(&provider, &store, resources(), Phase::Setup, CancelFlag::new());
    let (clean, _) = apply(&provider, &store, resources(), Phase::Consume, CancelFlag::new());
    assert!(clean);

    let record = store.load().expect("load");
    let bucket = &record.nodes[&node("bucket")];
    assert_eq!(bucket.outputs["upstream"], json!("arn:role"));
    assert_eq!(bucket.credential, CredentialId::new("cred-consume".to_string()));
}

#[test]
fn consume_node_fails_when_setup_dependency_is_missing() {
    let (_temp, store) = store();
    let provider = ScriptedProvider::default();
    let (clean, report) = apply(
        &provider,
        &store,
        vec![
            spec("role", Phase::Setup),
            referencing("bucket", Phase::Consume, "role"),
        ],
        Phase::Consume,
        CancelFlag::new(),
    );
    assert!(!clean);
    assert_eq!(outcome(&report, "bucket"), NodeOutcome::Failed);
    assert!(provider.calls().is_empty());
}

#[test]
fn backoff_doubles_and_is_capped() {
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(350),
    };
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(3), Duration::from_millis(350));
}

/// Records how many provider calls overlap.
#[derive(Clone, Default)]
struct GaugeProvider {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ResourceProvider for GaugeProvider {
    fn name(&self) -> &str {
        "gauge"
    }

    fn supports(&self, kind: &ResourceKind) -> bool {
        *kind == widget()
    }

    fn apply(
        &self,
        request: &ProviderRequest<'_>,
        _cancel: &CancelFlag,
    ) -> Result<ProviderOutputs, ProviderError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(40));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ProviderOutputs {
            outputs: request.inputs.clone(),
            sensitive: BTreeSet::new(),
        })
    }

    fn destroy(
        &self,
        _request: &ProviderRequest<'_>,
        _cancel: &CancelFlag,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn peak_calls_with(concurrency: usize) -> usize {
    let (_temp, store) = store();
    let provider = GaugeProvider::default();
    let resources = (1..=6)
        .map(|index| spec(&format!("n{index}"), Phase::Setup))
        .collect();
    let graph = ResourceGraph::from_resources(resources).expect("graph");
    let registry = ProviderRegistry::from_providers(vec![Box::new(provider.clone())]);
    let executor = Executor::new(
        &registry,
        ExecutorOptions {
            concurrency,
            ..options()
        },
        CancelFlag::new(),
    );
    let mut session =
        Session::open(&store, "apply", chrono::Duration::minutes(5)).expect("session");
    let mut report = ApplyReport::new(Operation::Apply, session.record.workflow);
    let clean = executor
        .apply_phase(
            &graph,
            Phase::Setup,
            &credential(Phase::Setup),
            &mut session,
            &mut report,
        )
        .expect("apply phase");
    session.close().expect("close");

    assert!(clean);
    assert_eq!(report.results.len(), 6);
    assert_eq!(provider.in_flight.load(Ordering::SeqCst), 0);
    provider.peak.load(Ordering::SeqCst)
}

#[test]
fn independent_nodes_run_in_parallel_up_to_the_limit() {
    assert_eq!(peak_calls_with(2), 2);
}

#[test]
fn concurrency_of_one_runs_calls_serially() {
    assert_eq!(peak_calls_with(1), 1);
}
