use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keystage_domain::{CredentialMaterial, NodeId, Phase, ResourceKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::error::ProviderError;
use crate::resolve::{Outputs, sha256_bytes};

/// Exit status a plugin uses to ask for a retry (`EX_TEMPFAIL`).
pub const TRANSIENT_EXIT_CODE: i32 = 75;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One provider call for one node.
#[derive(Debug)]
pub struct ProviderRequest<'a> {
    pub node: &'a NodeId,
    pub kind: &'a ResourceKind,
    pub phase: Phase,
    pub inputs: &'a Outputs,
    pub prior_outputs: Option<&'a Outputs>,
    pub credential: &'a CredentialMaterial,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutputs {
    #[serde(default)]
    pub outputs: Outputs,
    /// Names of outputs whose values must never be displayed.
    #[serde(default)]
    pub sensitive: BTreeSet<String>,
}

pub trait ResourceProvider: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, kind: &ResourceKind) -> bool;

    /// Create or update the resource and return its outputs.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying call fails or is cancelled.
    fn apply(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<ProviderOutputs, ProviderError>;

    /// Remove the resource. Removing something already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying call fails or is cancelled.
    fn destroy(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), ProviderError>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            providers: vec![Box::new(DataProvider)],
        }
    }

    #[must_use]
    pub fn from_providers(providers: Vec<Box<dyn ResourceProvider>>) -> Self {
        Self { providers }
    }

    /// Configured plugins first, then built-ins.
    #[must_use]
    pub fn with_plugins(plugins: Vec<ExecProvider>) -> Self {
        let mut providers: Vec<Box<dyn ResourceProvider>> = plugins
            .into_iter()
            .map(|plugin| Box::new(plugin) as Box<dyn ResourceProvider>)
            .collect();
        providers.push(Box::new(DataProvider));
        Self { providers }
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|provider| provider.name()).collect()
    }

    /// First provider that supports `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NoProvider`] when nothing handles the kind.
    pub fn select(&self, kind: &ResourceKind) -> Result<&dyn ResourceProvider, ProviderError> {
        self.providers
            .iter()
            .find(|provider| provider.supports(kind))
            .map(std::ops::Deref::deref)
            .ok_or_else(|| ProviderError::NoProvider {
                kind: kind.to_string(),
            })
    }
}

/// Built-in provider for `data` resources: echoes inputs and adds a stable id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataProvider;

impl ResourceProvider for DataProvider {
    fn name(&self) -> &str {
        "data"
    }

    fn supports(&self, kind: &ResourceKind) -> bool {
        *kind == ResourceKind::Data
    }

    fn apply(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<ProviderOutputs, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let mut outputs = request.inputs.clone();
        let digest = sha256_bytes(request.node.as_bytes());
        outputs
            .entry("id".to_string())
            .or_insert_with(|| serde_json::Value::from(format!("data-{}", &digest[..12])));
        Ok(ProviderOutputs {
            outputs,
            sensitive: BTreeSet::new(),
        })
    }

    fn destroy(
        &self,
        _request: &ProviderRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        Ok(())
    }
}

/// External plugin speaking JSON over stdin/stdout.
///
/// Invoked as `<command> <args…> apply|destroy`. Exit code
/// [`TRANSIENT_EXIT_CODE`] marks a retryable failure.
#[derive(Debug, Clone)]
pub struct ExecProvider {
    name: String,
    command: String,
    args: Vec<String>,
    kinds: BTreeSet<ResourceKind>,
}

#[derive(Serialize)]
struct WireCredential<'a> {
    id: &'a str,
    access_key_id: &'a str,
    secret_access_key: &'a str,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    action: &'a str,
    node: &'a str,
    kind: &'a str,
    phase: Phase,
    inputs: &'a Outputs,
    prior_outputs: Option<&'a Outputs>,
    credential: WireCredential<'a>,
}

impl ExecProvider {
    #[must_use]
    pub fn new(
        name: String,
        command: String,
        args: Vec<String>,
        kinds: BTreeSet<ResourceKind>,
    ) -> Self {
        Self {
            name,
            command,
            args,
            kinds,
        }
    }

    fn invoke(
        &self,
        action: &str,
        request: &ProviderRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let binary = which::which(&self.command).map_err(|_| ProviderError::PluginMissing {
            plugin: self.name.clone(),
            binary: self.command.clone(),
        })?;

        let payload = serde_json::to_vec(&WireRequest {
            action,
            node: request.node.as_str(),
            kind: request.kind.as_str(),
            phase: request.phase,
            inputs: request.inputs,
            prior_outputs: request.prior_outputs,
            credential: WireCredential {
                id: request.credential.id.as_str(),
                access_key_id: &request.credential.access_key_id,
                secret_access_key: &request.credential.secret_access_key,
                expires_at: request.credential.expires_at,
            },
        })
        .map_err(|source| ProviderError::EncodeRequest {
            plugin: self.name.clone(),
            source,
        })?;

        debug!(plugin = %self.name, node = %request.node, action, "invoking plugin");

        let mut child = Command::new(&binary)
            .args(&self.args)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProviderError::Spawn {
                plugin: self.name.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload) {
                Ok(()) => {}
                // Plugins are free to ignore the request body.
                Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {}
                Err(source) => {
                    stop(&mut child);
                    return Err(self.io_error("failed to write request", source));
                }
            }
        }

        let status = self.wait(&mut child, cancel)?;
        let stdout = self.collect(stdout, "failed to read stdout")?;
        let stderr = String::from_utf8_lossy(&self.collect(stderr, "failed to read stderr")?)
            .trim()
            .to_string();

        if status.success() {
            return Ok(stdout);
        }

        if status.code() == Some(TRANSIENT_EXIT_CODE) {
            return Err(ProviderError::Transient {
                provider: self.name.clone(),
                message: stderr,
            });
        }

        Err(ProviderError::Failed {
            plugin: self.name.clone(),
            status,
            stderr,
        })
    }

    fn wait(&self, child: &mut Child, cancel: &CancelFlag) -> Result<ExitStatus, ProviderError> {
        loop {
            if cancel.is_cancelled() {
                stop(child);
                return Err(ProviderError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    stop(child);
                    return Err(self.io_error("failed to wait for plugin", source));
                }
            }
        }
    }

    fn collect(
        &self,
        handle: Option<JoinHandle<io::Result<Vec<u8>>>>,
        context: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let Some(handle) = handle else {
            return Ok(Vec::new());
        };
        handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("reader thread panicked")))
            .map_err(|source| self.io_error(context, source))
    }

    fn io_error(&self, context: &str, source: io::Error) -> ProviderError {
        ProviderError::Io {
            plugin: self.name.clone(),
            context: context.to_string(),
            source,
        }
    }
}

impl ResourceProvider for ExecProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: &ResourceKind) -> bool {
        self.kinds.contains(kind)
    }

    fn apply(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<ProviderOutputs, ProviderError> {
        let stdout = self.invoke("apply", request, cancel)?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(ProviderOutputs::default());
        }
        serde_json::from_slice(&stdout).map_err(|source| ProviderError::InvalidResponse {
            plugin: self.name.clone(),
            source,
        })
    }

    fn destroy(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), ProviderError> {
        self.invoke("destroy", request, cancel).map(|_| ())
    }
}

fn drain<R>(stream: Option<R>) -> Option<JoinHandle<io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            stream.read_to_end(&mut buffer).map(|_| buffer)
        })
    })
}

fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::collections::{BTreeMap, BTreeSet};

    use chrono::Utc;
    use keystage_domain::{CredentialId, CredentialMaterial, NodeId, Phase, ResourceKind};
    use serde_json::json;

    use super::{DataProvider, ExecProvider, ProviderRegistry, ProviderRequest, ResourceProvider};
    use crate::cancel::CancelFlag;
    use crate::error::ProviderError;
    use crate::resolve::Outputs;

    fn credential() -> CredentialMaterial {
        CredentialMaterial {
            id: CredentialId::new("cred-test".to_string()),
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            phase: Phase::Setup,
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn data_provider_echoes_inputs_with_stable_id() {
        let node = NodeId::try_from("settings").expect("node");
        let inputs: Outputs = BTreeMap::from([("region".to_string(), json!("eu-west-1"))]);
        let material = credential();
        let request = ProviderRequest {
            node: &node,
            kind: &ResourceKind::Data,
            phase: Phase::Setup,
            inputs: &inputs,
            prior_outputs: None,
            credential: &material,
        };

        let first = DataProvider.apply(&request, &CancelFlag::new()).expect("apply");
        let second = DataProvider.apply(&request, &CancelFlag::new()).expect("apply");
        assert_eq!(first, second);
        assert_eq!(first.outputs["region"], json!("eu-west-1"));
        assert!(
            first.outputs["id"]
                .as_str()
                .is_some_and(|id| id.starts_with("data-"))
        );
    }

    #[test]
    fn registry_prefers_plugins_and_reports_unknown_kinds() {
        let custom = ResourceKind::Custom("bucket".to_string());
        let plugin = ExecProvider::new(
            "cloud".to_string(),
            "cloud-plugin".to_string(),
            Vec::new(),
            BTreeSet::from([custom.clone(), ResourceKind::Data]),
        );
        let registry = ProviderRegistry::with_plugins(vec![plugin]);
        assert_eq!(registry.names(), vec!["cloud", "data"]);
        assert_eq!(registry.select(&ResourceKind::Data).expect("data").name(), "cloud");
        assert_eq!(registry.select(&custom).expect("custom").name(), "cloud");

        let builtin = ProviderRegistry::builtin();
        assert!(matches!(
            builtin.select(&ResourceKind::Role),
            Err(ProviderError::NoProvider { .. })
        ));
    }

    #[test]
    fn missing_plugin_binary_is_reported() {
        let plugin = ExecProvider::new(
            "ghost".to_string(),
            "keystage-plugin-that-does-not-exist".to_string(),
            Vec::new(),
            BTreeSet::from([ResourceKind::Role]),
        );
        let node = NodeId::try_from("role").expect("node");
        let inputs = Outputs::new();
        let material = credential();
        let request = ProviderRequest {
            node: &node,
            kind: &ResourceKind::Role,
            phase: Phase::Setup,
            inputs: &inputs,
            prior_outputs: None,
            credential: &material,
        };
        let error = plugin
            .apply(&request, &CancelFlag::new())
            .expect_err("missing binary");
        assert!(matches!(error, ProviderError::PluginMissing { .. }));
    }

    #[cfg(unix)]
    mod exec {
        use std::collections::BTreeSet;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        use keystage_domain::{NodeId, Phase, ResourceKind};

        use super::credential;
        use crate::cancel::CancelFlag;
        use crate::error::ProviderError;
        use crate::providers::{ExecProvider, ProviderOutputs, ProviderRequest, ResourceProvider};
        use crate::resolve::Outputs;

        fn script(dir: &Path, body: &str) -> ExecProvider {
            let path = dir.join("plugin.sh");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            let mut permissions = fs::metadata(&path).expect("metadata").permissions();
            permissions.set_mode(0o755);
            fs::set_permissions(&path, permissions).expect("chmod");
            ExecProvider::new(
                "script".to_string(),
                path.display().to_string(),
                Vec::new(),
                BTreeSet::from([ResourceKind::Role]),
            )
        }

        fn call(plugin: &ExecProvider) -> Result<ProviderOutputs, ProviderError> {
            let node = NodeId::try_from("role").expect("node");
            let inputs = Outputs::new();
            let material = credential();
            let request = ProviderRequest {
                node: &node,
                kind: &ResourceKind::Role,
                phase: Phase::Setup,
                inputs: &inputs,
                prior_outputs: None,
                credential: &material,
            };
            plugin.apply(&request, &CancelFlag::new())
        }

        #[test]
        fn parses_outputs_and_sensitive_names() {
            let temp = tempfile::tempdir().expect("tempdir");
            let plugin = script(
                temp.path(),
                r#"cat >/dev/null
printf '{"outputs":{"arn":"arn:role","secret_id":"s-1"},"sensitive":["secret_id"]}'"#,
            );
            let outputs = call(&plugin).expect("apply");
            assert_eq!(outputs.outputs["arn"], "arn:role");
            assert!(outputs.sensitive.contains("secret_id"));
        }

        #[test]
        fn passes_action_as_last_argument() {
            let temp = tempfile::tempdir().expect("tempdir");
            let plugin = script(
                temp.path(),
                r#"cat >/dev/null
printf '{"outputs":{"action":"%s"}}' "$1""#,
            );
            let outputs = call(&plugin).expect("apply");
            assert_eq!(outputs.outputs["action"], "apply");
        }

        #[test]
        fn exit_code_75_is_transient() {
            let temp = tempfile::tempdir().expect("tempdir");
            let plugin = script(temp.path(), "echo throttled >&2\nexit 75");
            let error = call(&plugin).expect_err("transient");
            assert!(error.is_retryable());
            assert!(error.to_string().contains("throttled"));
        }

        #[test]
        fn other_failures_carry_stderr() {
            let temp = tempfile::tempdir().expect("tempdir");
            let plugin = script(temp.path(), "echo 'access denied' >&2\nexit 3");
            let error = call(&plugin).expect_err("failed");
            assert!(!error.is_retryable());
            assert!(error.to_string().contains("access denied"), "unexpected: {error}");
        }

        #[test]
        fn malformed_output_is_rejected() {
            let temp = tempfile::tempdir().expect("tempdir");
            let plugin = script(temp.path(), "echo not-json");
            let error = call(&plugin).expect_err("malformed");
            assert!(matches!(error, ProviderError::InvalidResponse { .. }));
        }
    }
}
