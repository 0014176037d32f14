#![allow(clippy::expect_used)]

use std::fs;
use std::path::Path;

use keystage_e2e::harness::{RunResult, run_keystage, write_file};
use serde_json::Value;
use tempfile::TempDir;

const EPHEMERAL_CREDENTIALS: &str = r#"
credential("setup", { ephemeral = true })
credential("consume", { ephemeral = true })
"#;

fn run(subcommand: &str, root: &Path, flags: &[&str]) -> RunResult {
    run_with_env(subcommand, root, flags, &[])
}

fn run_with_env(
    subcommand: &str,
    root: &Path,
    flags: &[&str],
    env_overrides: &[(String, String)],
) -> RunResult {
    let output =
        run_keystage(subcommand, root, flags, env_overrides).expect("run keystage binary");
    println!("{}", output.transcript());
    output
}

fn json(output: &RunResult) -> Value {
    serde_json::from_str(&output.stdout).expect("stdout is a JSON report")
}

fn record(root: &Path) -> Value {
    let raw = fs::read_to_string(root.join(".keystage/state.json")).expect("read state");
    serde_json::from_str(&raw).expect("state is JSON")
}

fn node_ids(report: &Value, key: &str) -> Vec<String> {
    report[key]
        .as_array()
        .expect("array")
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .or_else(|| entry["node"].as_str())
                .expect("node id")
                .to_string()
        })
        .collect()
}

#[test]
fn reference_output_flows_into_dependent_input() {
    let temp = TempDir::new().expect("tempdir");
    write_file(
        &temp.path().join("main.lua"),
        &format!(
            r#"{EPHEMERAL_CREDENTIALS}
resource("data", "b", {{ attrs = {{ y = ref("a", "x") }} }})
resource("data", "a", {{ attrs = {{ x = "hello" }} }})
"#
        ),
    )
    .expect("write manifest");

    let plan = run("plan", temp.path(), &["--format", "json"]);
    assert_eq!(plan.exit_code, 2, "{}", plan.transcript());
    assert_eq!(node_ids(&json(&plan), "execution_order"), ["a", "b"]);

    let apply = run("apply", temp.path(), &["--format", "json"]);
    assert_eq!(apply.exit_code, 0, "{}", apply.transcript());
    assert_eq!(node_ids(&json(&apply), "results"), ["a", "b"]);

    let state = record(temp.path());
    assert_eq!(state["nodes"]["b"]["outputs"]["y"], "hello");
    assert_eq!(state["workflow"], "consume_applied");
}

#[test]
fn apply_walks_setup_rotate_consume_and_is_idempotent() {
    let temp = TempDir::new().expect("tempdir");
    write_file(
        &temp.path().join("main.lua"),
        &format!(
            r#"{EPHEMERAL_CREDENTIALS}
local auth = resource("data", "auth", {{ attrs = {{ path = "approle" }} }})
resource("data", "app", {{ phase = "consume", attrs = {{ mount = ref(auth.id, "path") }} }})
"#
        ),
    )
    .expect("write manifest");

    let first = run("apply", temp.path(), &["--format", "json"]);
    assert_eq!(first.exit_code, 0, "{}", first.transcript());
    let report = json(&first);
    assert_eq!(
        report["phases"],
        serde_json::json!(["setup", "rotate", "consume"])
    );
    assert_eq!(report["workflow_after"], "consume_applied");

    let second = run("apply", temp.path(), &["--format", "json"]);
    assert_eq!(second.exit_code, 0, "{}", second.transcript());
    let second_json = json(&second);
    let outcomes: Vec<&str> = second_json["results"]
        .as_array()
        .expect("results")
        .iter()
        .map(|result| result["outcome"].as_str().expect("outcome"))
        .collect();
    assert_eq!(outcomes, ["unchanged", "unchanged"]);

    let plan = run("plan", temp.path(), &["--color", "never"]);
    assert_eq!(plan.exit_code, 0, "{}", plan.transcript());
    assert!(plan.stdout.contains("Plan: 2 unchanged"), "{}", plan.stdout);
}

#[test]
fn cycles_are_named_and_nothing_is_applied() {
    let temp = TempDir::new().expect("tempdir");
    write_file(
        &temp.path().join("main.lua"),
        &format!(
            r#"{EPHEMERAL_CREDENTIALS}
resource("data", "a", {{ depends_on = {{ "b" }} }})
resource("data", "b", {{ depends_on = {{ "a" }} }})
"#
        ),
    )
    .expect("write manifest");

    let plan = run("plan", temp.path(), &["--color", "never"]);
    assert_eq!(plan.exit_code, 1, "{}", plan.transcript());
    assert!(plan.stdout.contains("a -> b -> a"), "{}", plan.stdout);

    let apply = run("apply", temp.path(), &[]);
    assert_eq!(apply.exit_code, 1, "{}", apply.transcript());
    assert!(
        apply.stderr.contains("dependency cycle detected"),
        "{}",
        apply.stderr
    );
    assert!(!temp.path().join(".keystage/state.json").exists());
}

#[test]
fn unresolved_references_name_the_missing_node() {
    let temp = TempDir::new().expect("tempdir");
    write_file(
        &temp.path().join("main.lua"),
        r#"resource("data", "app", { attrs = { db = ref("database", "url") } })"#,
    )
    .expect("write manifest");

    let apply = run("apply", temp.path(), &[]);
    assert_eq!(apply.exit_code, 1, "{}", apply.transcript());
    assert!(apply.stderr.contains("database"), "{}", apply.stderr);
}

#[test]
fn shared_credentials_are_rejected_as_stale() {
    let temp = TempDir::new().expect("tempdir");
    write_file(
        &temp.path().join("main.lua"),
        r#"
credential("setup", { access_key_id = "AKIASHARED0001", secret_access_key = env("SHARED_SECRET") })
credential("consume", { access_key_id = "AKIASHARED0001", secret_access_key = env("SHARED_SECRET") })
resource("data", "auth", {})
resource("data", "app", { phase = "consume", attrs = { auth = ref("auth", "id") } })
"#,
    )
    .expect("write manifest");
    let secret = "very-secret-value-123".to_string();
    let env = [("SHARED_SECRET".to_string(), secret.clone())];

    let apply = run_with_env("apply", temp.path(), &[], &env);
    assert_eq!(apply.exit_code, 1, "{}", apply.transcript());
    assert!(
        apply.stderr.contains("stale credential reuse"),
        "{}",
        apply.stderr
    );
    assert!(!apply.stdout.contains(&secret) && !apply.stderr.contains(&secret));

    let state = record(temp.path());
    assert_eq!(state["workflow"], "setup_applied");
    assert!(state["nodes"]["app"].is_null());
    let raw = fs::read_to_string(temp.path().join(".keystage/state.json")).expect("state");
    assert!(!raw.contains(&secret));
}

#[test]
fn manifests_without_shared_references_converge_in_either_order() {
    let first = r#"resource("data", "queue", { attrs = { size = 10 } })"#;
    let second = r#"resource("data", "topic", { attrs = { name = "events" } })"#;

    let mut states = Vec::new();
    for (a, b) in [(first, second), (second, first)] {
        let temp = TempDir::new().expect("tempdir");
        write_file(
            &temp.path().join("0-creds.lua"),
            r#"credential("setup", { ephemeral = true })"#,
        )
        .expect("write credentials");
        write_file(&temp.path().join("a.lua"), a).expect("write a");
        write_file(&temp.path().join("b.lua"), b).expect("write b");

        let apply = run("apply", temp.path(), &["--phase", "setup"]);
        assert_eq!(apply.exit_code, 0, "{}", apply.transcript());

        let state = record(temp.path());
        let outputs: Vec<(String, Value)> = state["nodes"]
            .as_object()
            .expect("nodes")
            .iter()
            .map(|(id, node)| (id.clone(), node["outputs"].clone()))
            .collect();
        states.push((state["workflow"].clone(), outputs));
    }

    assert_eq!(states[0], states[1]);
    assert_eq!(states[0].0, "setup_applied");
}

#[test]
fn lock_conflicts_and_unlock() {
    let temp = TempDir::new().expect("tempdir");
    write_file(
        &temp.path().join("main.lua"),
        &format!("{EPHEMERAL_CREDENTIALS}\nresource(\"data\", \"x\", {{}})\n"),
    )
    .expect("write manifest");
    let lock = serde_json::json!({
        "id": "stale-lock",
        "owner": "someone@elsewhere:1",
        "operation": "apply",
        "acquired_at": "2026-01-01T00:00:00Z",
        "expires_at": "2099-01-01T01:00:00Z",
    });
    write_file(
        &temp.path().join(".keystage/state.json.lock"),
        &lock.to_string(),
    )
    .expect("write lock");

    let blocked = run("apply", temp.path(), &[]);
    assert_eq!(blocked.exit_code, 1, "{}", blocked.transcript());
    assert!(
        blocked.stderr.contains("concurrent execution conflict"),
        "{}",
        blocked.stderr
    );

    let wrong = run("unlock", temp.path(), &["--lock-id", "other"]);
    assert_eq!(wrong.exit_code, 1, "{}", wrong.transcript());

    let unlocked = run("unlock", temp.path(), &["--lock-id", "stale-lock"]);
    assert_eq!(unlocked.exit_code, 0, "{}", unlocked.transcript());

    let apply = run("apply", temp.path(), &[]);
    assert_eq!(apply.exit_code, 0, "{}", apply.transcript());
}

#[cfg(unix)]
mod plugin {
    use std::fs;

    use keystage_e2e::harness::{plugin_calls, write_file, write_logging_plugin};
    use tempfile::TempDir;

    use super::{json, record, run};

    fn plugin_workspace() -> TempDir {
        let temp = TempDir::new().expect("tempdir");
        write_logging_plugin(&temp.path().join("bin/cloud.sh")).expect("write plugin");
        write_file(
            &temp.path().join("keystage.toml"),
            &format!(
                r#"
[[plugins]]
name = "cloud"
command = "bin/cloud.sh"
args = ["{}"]
kinds = ["role", "cloud_resource"]
"#,
                temp.path().join("calls.log").display()
            ),
        )
        .expect("write config");
        write_file(
            &temp.path().join("main.lua"),
            r#"
credential("setup", { ephemeral = true })
credential("consume", { ephemeral = true })

local role = resource("role", "deployer", { attrs = { policy = "storage:*" } })
resource("cloud_resource", "bucket", {
  phase = "consume",
  attrs = { role_arn = ref(role.id, "arn") },
})
"#,
        )
        .expect("write manifest");
        temp
    }

    fn calls(temp: &TempDir) -> Vec<Vec<String>> {
        plugin_calls(&temp.path().join("calls.log")).expect("read plugin log")
    }

    #[test]
    fn setup_and_consume_calls_use_distinct_credentials() {
        let temp = plugin_workspace();

        let apply = run("apply", temp.path(), &["--format", "json"]);
        assert_eq!(apply.exit_code, 0, "{}", apply.transcript());
        assert_eq!(json(&apply)["workflow_after"], "consume_applied");

        let calls = calls(&temp);
        assert_eq!(calls.len(), 2, "{calls:?}");
        assert_eq!(calls[0][..2], ["apply", "deployer"]);
        assert_eq!(calls[1][..2], ["apply", "bucket"]);
        assert_ne!(calls[0][2], calls[1][2], "consume reused the setup key");

        let state = record(temp.path());
        assert_eq!(
            state["nodes"]["deployer"]["outputs"]["arn"],
            "arn:test:deployer"
        );
        assert_eq!(
            state["nodes"]["bucket"]["outputs"]["arn"],
            "arn:test:bucket"
        );
        let raw = fs::read_to_string(temp.path().join(".keystage/state.json")).expect("state");
        assert!(!raw.contains("secret_access_key"));
    }

    #[test]
    fn destroy_respects_dependents_and_round_trips() {
        let temp = plugin_workspace();

        let apply = run("apply", temp.path(), &[]);
        assert_eq!(apply.exit_code, 0, "{}", apply.transcript());

        let premature = run("destroy", temp.path(), &["--phase", "setup"]);
        assert_eq!(premature.exit_code, 1, "{}", premature.transcript());
        assert!(
            premature.stderr.contains("still referenced by bucket"),
            "{}",
            premature.stderr
        );

        let destroy = run("destroy", temp.path(), &["--format", "json"]);
        assert_eq!(destroy.exit_code, 0, "{}", destroy.transcript());
        assert_eq!(json(&destroy)["workflow_after"], "uninitialized");

        let destroys: Vec<String> = calls(&temp)
            .into_iter()
            .filter(|call| call[0] == "destroy")
            .map(|call| call[1].clone())
            .collect();
        assert_eq!(destroys, ["bucket", "deployer"]);

        let reapply = run("apply", temp.path(), &[]);
        assert_eq!(reapply.exit_code, 0, "{}", reapply.transcript());
        assert_eq!(record(temp.path())["workflow"], "consume_applied");
    }
}
