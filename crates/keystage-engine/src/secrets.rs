use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::SecretError;

/// Where a `secret()` URI reads its value from.
#[derive(Debug, PartialEq, Eq)]
pub enum SecretSource {
    Cli {
        binary: &'static str,
        args: Vec<String>,
    },
    Env {
        name: String,
    },
    File {
        path: PathBuf,
    },
}

/// Parse a secret URI such as `op://vault/item/field` or `env://TOKEN`.
///
/// # Errors
///
/// Returns an error when the URI has no scheme, an unknown scheme, or a path
/// that does not fit its scheme.
pub fn parse_secret_uri(uri: &str) -> Result<SecretSource, SecretError> {
    let Some((scheme, path)) = uri.split_once("://") else {
        return Err(SecretError::InvalidUri {
            uri: uri.to_string(),
        });
    };

    match scheme {
        "op" => {
            if path.is_empty() {
                return Err(SecretError::InvalidSchemePath {
                    scheme: "op",
                    expected: "a path (e.g. op://vault/item/field)",
                    uri: uri.to_string(),
                });
            }
            Ok(SecretSource::Cli {
                binary: "op",
                args: vec!["read".to_string(), uri.to_string()],
            })
        }
        "bw" => {
            let parts: Vec<&str> = path.split('/').collect();
            match parts.as_slice() {
                [item] if !item.is_empty() => Ok(SecretSource::Cli {
                    binary: "bw",
                    args: vec![
                        "get".to_string(),
                        "password".to_string(),
                        (*item).to_string(),
                    ],
                }),
                [item, field] if !item.is_empty() && !field.is_empty() => Ok(SecretSource::Cli {
                    binary: "bw",
                    args: vec!["get".to_string(), (*field).to_string(), (*item).to_string()],
                }),
                _ => Err(SecretError::InvalidSchemePath {
                    scheme: "bw",
                    expected: "bw://item or bw://item/field",
                    uri: uri.to_string(),
                }),
            }
        }
        "env" => {
            if path.is_empty() || path.contains('/') {
                return Err(SecretError::InvalidSchemePath {
                    scheme: "env",
                    expected: "a variable name (e.g. env://VAULT_TOKEN)",
                    uri: uri.to_string(),
                });
            }
            Ok(SecretSource::Env {
                name: path.to_string(),
            })
        }
        "file" => {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(SecretError::InvalidSchemePath {
                    scheme: "file",
                    expected: "an absolute path (e.g. file:///run/secrets/token)",
                    uri: uri.to_string(),
                });
            }
            Ok(SecretSource::File {
                path: PathBuf::from(path),
            })
        }
        _ => Err(SecretError::UnsupportedScheme {
            scheme: scheme.to_string(),
            uri: uri.to_string(),
        }),
    }
}

/// Resolve a secret URI to its value, trimmed of surrounding whitespace.
///
/// # Errors
///
/// Returns an error when the URI is invalid, the backing CLI is missing or
/// fails, the variable or file cannot be read, or the value is empty.
pub fn resolve_secret(uri: &str) -> Result<String, SecretError> {
    let value = match parse_secret_uri(uri)? {
        SecretSource::Cli { binary, args } => {
            let resolved_path = which::which(binary).map_err(|_| SecretError::CliMissing {
                uri: uri.to_string(),
                binary,
            })?;
            run_secret_command(&resolved_path, binary, &args, uri)?
        }
        SecretSource::Env { name } => env::var(&name)
            .map_err(|_| SecretError::EnvNotSet {
                uri: uri.to_string(),
                name,
            })?
            .trim()
            .to_string(),
        SecretSource::File { path } => fs::read_to_string(&path)
            .map_err(|source| SecretError::ReadFile {
                uri: uri.to_string(),
                path,
                source,
            })?
            .trim()
            .to_string(),
    };

    if value.is_empty() {
        return Err(SecretError::EmptyValue {
            uri: uri.to_string(),
        });
    }
    Ok(value)
}

fn run_secret_command(
    binary_path: &Path,
    binary: &'static str,
    args: &[String],
    uri: &str,
) -> Result<String, SecretError> {
    let output = Command::new(binary_path)
        .args(args)
        .output()
        .map_err(|source| SecretError::CommandSpawn {
            binary,
            binary_path: binary_path.to_path_buf(),
            uri: uri.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SecretError::CommandFailed {
            binary,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
