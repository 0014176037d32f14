use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use keystage_domain::{
    AttributeValue, CredentialSource, IssuerSpec, ManifestPath, ManifestSpec, NodeId, Phase,
    Reference, ResourceKind, ResourceSpec,
};
use mlua::{
    AnyUserData, Error as LuaError, Lua, MultiValue, Result as LuaResult, Table, UserData, Value,
};

use crate::error::ManifestEvalError;
use crate::secrets::resolve_secret;

const RESOURCE_OPTIONS: [&str; 3] = ["phase", "attrs", "depends_on"];
const CREDENTIAL_OPTIONS: [&str; 6] = [
    "access_key_id",
    "secret_access_key",
    "expires_at",
    "command",
    "args",
    "ephemeral",
];
const MAX_ATTRIBUTE_DEPTH: usize = 32;

/// A manifest after evaluation, with the values it must never print.
#[derive(Debug, Clone)]
pub struct EvaluatedManifest {
    pub spec: ManifestSpec,
    pub warnings: Vec<String>,
    pub sensitive: BTreeSet<String>,
}

/// `ref(...)` result carried through Lua untouched.
#[derive(Debug, Clone)]
struct LuaReference(Reference);

impl UserData for LuaReference {}

#[derive(Default)]
struct Collector {
    resources: Vec<ResourceSpec>,
    credentials: Vec<CredentialSource>,
    warnings: Vec<String>,
    sensitive: BTreeSet<String>,
}

fn runtime(message: impl Into<String>) -> LuaError {
    LuaError::RuntimeError(message.into())
}

fn single_string(args: &MultiValue, usage: &str) -> LuaResult<String> {
    if args.len() != 1 {
        return Err(runtime(format!("{usage} expects exactly one string argument")));
    }
    match args.front() {
        Some(Value::String(text)) => Ok(text.to_str()?.to_owned()),
        _ => Err(runtime(format!("{usage} expects exactly one string argument"))),
    }
}

fn reject_unknown_keys(table: &Table, allowed: &[&str], usage: &str) -> LuaResult<()> {
    for pair in table.pairs::<Value, Value>() {
        let (key, _) = pair?;
        let name = match &key {
            Value::String(text) => text.to_str()?.to_owned(),
            other => {
                return Err(runtime(format!(
                    "{usage}: option keys must be strings, got {}",
                    other.type_name()
                )));
            }
        };
        if !allowed.contains(&name.as_str()) {
            return Err(runtime(format!(
                "{usage}: unknown option \"{name}\" (expected one of: {})",
                allowed.join(", ")
            )));
        }
    }
    Ok(())
}

fn optional_string(table: &Table, key: &str) -> LuaResult<Option<String>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(None),
        Value::String(text) => Ok(Some(text.to_str()?.to_owned())),
        _ => Err(runtime(format!("{key} must be a string"))),
    }
}

fn string_list(table: &Table, key: &str) -> LuaResult<Vec<String>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(Vec::new()),
        Value::Table(items) => {
            let mut out = Vec::new();
            for value in items.sequence_values::<Value>() {
                let Value::String(text) = value? else {
                    return Err(runtime(format!("{key} must contain only strings")));
                };
                out.push(text.to_str()?.to_owned());
            }
            Ok(out)
        }
        _ => Err(runtime(format!("{key} must be a list of strings"))),
    }
}

fn parse_phase(raw: &str) -> LuaResult<Phase> {
    raw.parse::<Phase>()
        .map_err(|error| runtime(error.to_string()))
}

fn parse_node_id(raw: String) -> LuaResult<NodeId> {
    NodeId::new(raw).map_err(|error| runtime(error.to_string()))
}

/// Accept either a handle returned by `resource()` or a bare id string.
fn node_from_value(value: &Value, usage: &str) -> LuaResult<NodeId> {
    match value {
        Value::String(text) => parse_node_id(text.to_str()?.to_owned()),
        Value::Table(handle) => match handle.get::<Value>("id")? {
            Value::String(text) => parse_node_id(text.to_str()?.to_owned()),
            _ => Err(runtime(format!(
                "{usage} expects a resource handle or id string"
            ))),
        },
        _ => Err(runtime(format!(
            "{usage} expects a resource handle or id string"
        ))),
    }
}

fn is_sequence(table: &Table) -> LuaResult<bool> {
    let length = table.raw_len();
    if length == 0 {
        return Ok(false);
    }
    let mut count = 0usize;
    for pair in table.pairs::<Value, Value>() {
        let (key, _) = pair?;
        let Value::Integer(index) = key else {
            return Ok(false);
        };
        if !usize::try_from(index).is_ok_and(|index| (1..=length).contains(&index)) {
            return Ok(false);
        }
        count += 1;
    }
    Ok(count == length)
}

/// Convert a Lua attribute value, keeping `ref()` values typed.
fn to_attribute(value: Value, depth: usize) -> LuaResult<AttributeValue> {
    if depth > MAX_ATTRIBUTE_DEPTH {
        return Err(runtime(format!(
            "attrs nest deeper than {MAX_ATTRIBUTE_DEPTH} levels (cyclic table?)"
        )));
    }

    match value {
        Value::Nil => Ok(AttributeValue::Literal(serde_json::Value::Null)),
        Value::Boolean(flag) => Ok(AttributeValue::Literal(serde_json::Value::Bool(flag))),
        Value::Integer(number) => Ok(AttributeValue::Literal(number.into())),
        Value::Number(number) => serde_json::Number::from_f64(number)
            .map(|number| AttributeValue::Literal(serde_json::Value::Number(number)))
            .ok_or_else(|| runtime(format!("attribute value {number} is not a finite number"))),
        Value::String(text) => Ok(AttributeValue::Literal(serde_json::Value::String(
            text.to_str()?.to_owned(),
        ))),
        Value::UserData(data) => reference_from_userdata(&data).map(AttributeValue::Reference),
        Value::Table(table) => {
            if is_sequence(&table)? {
                let mut items = Vec::new();
                for item in table.sequence_values::<Value>() {
                    items.push(to_attribute(item?, depth + 1)?);
                }
                Ok(AttributeValue::List(items))
            } else {
                let mut entries = BTreeMap::new();
                for pair in table.pairs::<Value, Value>() {
                    let (key, item) = pair?;
                    let key = match key {
                        Value::String(text) => text.to_str()?.to_owned(),
                        Value::Integer(index) => index.to_string(),
                        other => {
                            return Err(runtime(format!(
                                "attribute keys must be strings, got {}",
                                other.type_name()
                            )));
                        }
                    };
                    entries.insert(key, to_attribute(item, depth + 1)?);
                }
                Ok(AttributeValue::Map(entries))
            }
        }
        other => Err(runtime(format!(
            "unsupported attribute value of type {}",
            other.type_name()
        ))),
    }
}

fn reference_from_userdata(data: &AnyUserData) -> LuaResult<Reference> {
    let reference = data
        .borrow::<LuaReference>()
        .map_err(|_| runtime("only ref() values may be used as attribute userdata"))?;
    Ok(reference.0.clone())
}

fn add_resource(
    lua: &Lua,
    collector: &Rc<RefCell<Collector>>,
    manifest: &Path,
    args: MultiValue,
) -> LuaResult<Table> {
    const USAGE: &str = "resource(kind, id, opts?)";
    if !(2..=3).contains(&args.len()) {
        return Err(runtime(format!("{USAGE} expects 2 or 3 arguments")));
    }
    let mut args = args.into_iter();
    let kind = match args.next() {
        Some(Value::String(text)) => text
            .to_str()?
            .parse::<ResourceKind>()
            .map_err(|error| runtime(error.to_string()))?,
        _ => return Err(runtime(format!("{USAGE} expects kind string as first argument"))),
    };
    let id = match args.next() {
        Some(Value::String(text)) => parse_node_id(text.to_str()?.to_owned())?,
        _ => return Err(runtime(format!("{USAGE} expects id string as second argument"))),
    };
    let opts = match args.next() {
        None | Some(Value::Nil) => None,
        Some(Value::Table(table)) => Some(table),
        Some(_) => {
            return Err(runtime(format!("{USAGE} expects options table as third argument")));
        }
    };

    let mut spec = ResourceSpec::new(id.clone(), kind.clone(), Phase::Setup, manifest.to_path_buf());
    if let Some(opts) = &opts {
        reject_unknown_keys(opts, &RESOURCE_OPTIONS, USAGE)?;
        if let Some(phase) = optional_string(opts, "phase")? {
            spec.phase = parse_phase(&phase)?;
        }
        match opts.get::<Value>("attrs")? {
            Value::Nil => {}
            Value::Table(attrs) => {
                for pair in attrs.pairs::<Value, Value>() {
                    let (key, value) = pair?;
                    let Value::String(key) = key else {
                        return Err(runtime("attrs keys must be strings"));
                    };
                    spec.attributes
                        .insert(key.to_str()?.to_owned(), to_attribute(value, 1)?);
                }
            }
            _ => return Err(runtime("attrs must be a table")),
        }
        match opts.get::<Value>("depends_on")? {
            Value::Nil => {}
            Value::Table(items) => {
                for item in items.sequence_values::<Value>() {
                    spec.depends_on.push(node_from_value(&item?, "depends_on")?);
                }
            }
            _ => return Err(runtime("depends_on must be a list of handles or ids")),
        }
    }

    collector.borrow_mut().resources.push(spec);

    let handle = lua.create_table()?;
    handle.set("id", id.as_str())?;
    handle.set("kind", kind.as_str())?;
    Ok(handle)
}

fn parse_expiry(raw: &str) -> LuaResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| runtime(format!("expires_at must be RFC 3339 ({raw}): {error}")))
}

fn add_credential(
    collector: &Rc<RefCell<Collector>>,
    manifest: &Path,
    phase: &str,
    opts: &Table,
) -> LuaResult<()> {
    const USAGE: &str = "credential(phase, opts)";
    let phase = parse_phase(phase)?;
    if phase == Phase::Rotate {
        return Err(runtime(
            "credential phase must be \"setup\" or \"consume\"; rotate only switches between them",
        ));
    }
    reject_unknown_keys(opts, &CREDENTIAL_OPTIONS, USAGE)?;

    let mut collector = collector.borrow_mut();
    if collector.credentials.iter().any(|source| source.phase == phase) {
        return Err(runtime(format!(
            "credential(\"{phase}\", ...) is declared more than once"
        )));
    }

    let ephemeral = match opts.get::<Value>("ephemeral")? {
        Value::Nil => false,
        Value::Boolean(flag) => flag,
        _ => return Err(runtime("ephemeral must be a boolean")),
    };
    let command = optional_string(opts, "command")?;
    let access_key_id = optional_string(opts, "access_key_id")?;

    let issuer = match (ephemeral, command, access_key_id) {
        (true, None, None) => IssuerSpec::Ephemeral,
        (false, Some(binary), None) => IssuerSpec::Command {
            binary,
            args: string_list(opts, "args")?,
        },
        (false, None, Some(access_key_id)) => {
            let Some(secret_access_key) = optional_string(opts, "secret_access_key")? else {
                return Err(runtime(format!(
                    "{USAGE}: access_key_id requires secret_access_key"
                )));
            };
            if !collector.sensitive.contains(&secret_access_key) {
                collector.warnings.push(format!(
                    "{}: credential(\"{phase}\") uses a literal secret_access_key; prefer secret() or env()",
                    manifest.display()
                ));
            }
            collector.sensitive.insert(secret_access_key.clone());
            let expires_at = optional_string(opts, "expires_at")?
                .as_deref()
                .map(parse_expiry)
                .transpose()?;
            IssuerSpec::Static {
                access_key_id,
                secret_access_key,
                expires_at,
            }
        }
        _ => {
            return Err(runtime(format!(
                "{USAGE} expects exactly one of access_key_id, command or ephemeral = true"
            )));
        }
    };

    collector.credentials.push(CredentialSource {
        phase,
        issuer,
        manifest: ManifestPath::new(manifest.to_path_buf()),
    });
    Ok(())
}

fn create_lua() -> LuaResult<Lua> {
    let lua = Lua::new();
    let globals = lua.globals();

    // No filesystem or process access from manifests.
    for key in [
        "io", "os", "package", "debug", "dofile", "loadfile", "require",
    ] {
        globals.set(key, Value::Nil)?;
    }

    Ok(lua)
}

#[allow(clippy::too_many_lines)]
fn evaluate_with_lua(manifest_path: &Path, script: &str) -> LuaResult<EvaluatedManifest> {
    let collector = Rc::new(RefCell::new(Collector::default()));
    let lua = create_lua()?;
    let globals = lua.globals();

    {
        let collector = Rc::clone(&collector);
        let function = lua.create_function(move |_, args: MultiValue| {
            let name = single_string(&args, "env(name)")?;
            env::var_os(&name).map_or_else(
                || {
                    Err(runtime(format!(
                        "env(\"{name}\") is not set in the current environment"
                    )))
                },
                |value| {
                    let resolved = value.to_string_lossy().into_owned();
                    collector.borrow_mut().sensitive.insert(resolved.clone());
                    Ok(resolved)
                },
            )
        })?;
        globals.set("env", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let function = lua.create_function(move |_, args: MultiValue| {
            let uri = single_string(&args, "secret(uri)")?;
            let resolved = resolve_secret(&uri).map_err(|error| runtime(error.to_string()))?;
            collector.borrow_mut().sensitive.insert(resolved.clone());
            Ok(resolved)
        })?;
        globals.set("secret", function)?;
    }

    {
        let os_family = std::env::consts::OS;
        globals.set(
            "is_macos",
            lua.create_function(move |_, ()| Ok(os_family == "macos"))?,
        )?;
        globals.set(
            "is_linux",
            lua.create_function(move |_, ()| Ok(os_family == "linux"))?,
        )?;
        globals.set(
            "is_windows",
            lua.create_function(move |_, ()| Ok(os_family == "windows"))?,
        )?;
    }

    {
        let collector = Rc::clone(&collector);
        let manifest = manifest_path.to_path_buf();
        let function = lua.create_function(move |lua, args: MultiValue| {
            add_resource(lua, &collector, &manifest, args)
        })?;
        globals.set("resource", function)?;
    }

    {
        let function = lua.create_function(move |lua, (target, attribute): (Value, Value)| {
            let node = node_from_value(&target, "ref(handle_or_id, attribute)")?;
            let Value::String(attribute) = attribute else {
                return Err(runtime(
                    "ref(handle_or_id, attribute) expects attribute name string",
                ));
            };
            let attribute = attribute.to_str()?.to_owned();
            if attribute.is_empty() {
                return Err(runtime("ref() attribute name must not be empty"));
            }
            lua.create_userdata(LuaReference(Reference { node, attribute }))
        })?;
        globals.set("ref", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let manifest = manifest_path.to_path_buf();
        let function = lua.create_function(move |_, (phase, opts): (String, Table)| {
            add_credential(&collector, &manifest, &phase, &opts)
        })?;
        globals.set("credential", function)?;
    }

    lua.load(script)
        .set_name(manifest_path.to_string_lossy())
        .exec()?;

    let collected = collector.take();
    let mut spec = ManifestSpec::new(manifest_path.to_path_buf());
    spec.resources = collected.resources;
    spec.credentials = collected.credentials;
    Ok(EvaluatedManifest {
        spec,
        warnings: collected.warnings,
        sensitive: collected.sensitive,
    })
}

/// Evaluate a single manifest file.
///
/// # Errors
///
/// Returns an error when the manifest cannot be read, parsed, or evaluated.
pub fn evaluate_manifest(path: &Path) -> Result<EvaluatedManifest, ManifestEvalError> {
    let manifest_path =
        fs::canonicalize(path).map_err(|source| ManifestEvalError::CanonicalizePath {
            path: path.to_path_buf(),
            source,
        })?;
    if manifest_path.parent().is_none() {
        return Err(ManifestEvalError::MissingManifestParent {
            path: manifest_path,
        });
    }

    let script =
        fs::read_to_string(&manifest_path).map_err(|source| ManifestEvalError::ReadManifest {
            path: manifest_path.clone(),
            source,
        })?;

    evaluate_with_lua(&manifest_path, &script).map_err(|source| ManifestEvalError::LuaRuntime {
        path: manifest_path,
        source,
    })
}

/// Evaluate manifests in order.
///
/// # Errors
///
/// Returns the first manifest's evaluation error.
pub fn evaluate_many(paths: &[PathBuf]) -> Result<Vec<EvaluatedManifest>, ManifestEvalError> {
    paths.iter().map(|path| evaluate_manifest(path)).collect()
}
