use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

static BUILD_KEYSTAGE: OnceLock<Result<(), String>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub command_line: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    #[must_use]
    pub fn transcript(&self) -> String {
        format!(
            "$ {}\n[exit: {}]\n[stdout]\n{}[stderr]\n{}",
            self.command_line, self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Run `keystage <subcommand> <root> <flags…>` as an external process.
///
/// `NO_PAGER=1` is always set and `KEYSTAGE_LOG` is cleared so output stays
/// deterministic for assertions.
///
/// # Errors
///
/// Returns an error if building/running the `keystage` binary fails.
pub fn run_keystage(
    subcommand: &str,
    root: &Path,
    flags: &[&str],
    env_overrides: &[(String, String)],
) -> Result<RunResult, String> {
    ensure_keystage_built()?;
    let bin = keystage_bin()?;

    let mut command = Command::new(bin);
    command.env("NO_PAGER", "1");
    command.env_remove("KEYSTAGE_LOG");
    command.arg(subcommand);
    command.arg(root);
    command.args(flags);

    let mut command_parts = vec![
        "keystage".to_string(),
        subcommand.to_string(),
        root.display().to_string(),
    ];
    command_parts.extend(flags.iter().map(|flag| (*flag).to_string()));

    for (name, value) in env_overrides {
        command.env(name, value);
    }

    let output = command
        .output()
        .map_err(|error| format!("failed to run keystage {subcommand}: {error}"))?;

    Ok(RunResult {
        command_line: command_parts.join(" "),
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Write a text file, creating parent directories if needed.
///
/// # Errors
///
/// Returns an error if directories or file contents cannot be written.
pub fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Write a shell-script provider plugin that appends
/// `<action> <node> <access_key_id>` to `log` and answers `apply` with an
/// `arn` output.
///
/// # Errors
///
/// Returns an error if the script cannot be written or made executable.
#[cfg(unix)]
pub fn write_logging_plugin(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    write_file(
        path,
        r#"#!/bin/sh
log="$1"
action="$2"
body=$(cat)
node=$(printf '%s' "$body" | sed -n 's/.*"node":"\([^"]*\)".*/\1/p')
key=$(printf '%s' "$body" | sed -n 's/.*"access_key_id":"\([^"]*\)".*/\1/p')
echo "$action $node $key" >> "$log"
if [ "$action" = "apply" ]; then
  printf '{"outputs":{"arn":"arn:test:%s"}}' "$node"
fi
"#,
    )?;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)
}

/// Lines written by [`write_logging_plugin`], split into words.
///
/// # Errors
///
/// Returns an error if the log exists but cannot be read.
pub fn plugin_calls(log: &Path) -> std::io::Result<Vec<Vec<String>>> {
    let contents = match fs::read_to_string(log) {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    Ok(contents
        .lines()
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .collect())
}

fn ensure_keystage_built() -> Result<(), String> {
    match BUILD_KEYSTAGE.get_or_init(|| {
        let status = Command::new("cargo")
            .arg("build")
            .arg("-q")
            .arg("-p")
            .arg("keystage")
            .status()
            .map_err(|error| format!("failed to build keystage binary: {error}"))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "failed to build keystage binary: cargo exited with status {status}"
            ))
        }
    }) {
        Ok(()) => Ok(()),
        Err(error) => Err(error.clone()),
    }
}

fn keystage_bin() -> Result<PathBuf, String> {
    let mut path = std::env::current_exe()
        .map_err(|error| format!("failed to determine current executable: {error}"))?;
    if !path.pop() {
        return Err("failed to resolve test executable directory".to_string());
    }
    if path.ends_with("deps") {
        let _ = path.pop();
    }
    Ok(path.join(format!("keystage{}", std::env::consts::EXE_SUFFIX)))
}
