use std::collections::BTreeMap;

use keystage_domain::{AttributeValue, NodeId, ResourceSpec};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::WorkflowError;

pub type Outputs = BTreeMap<String, Value>;

/// Resolve every attribute of `spec` into concrete JSON.
///
/// References are looked up in `outputs`, which must hold the outputs of every
/// dependency. Nothing else is visible to a node.
///
/// # Errors
///
/// Returns [`WorkflowError::DependencyNotApplied`] when a referenced node has no
/// outputs yet, and [`WorkflowError::MissingOutput`] when it produced outputs
/// but not the referenced attribute.
pub fn resolve_attributes(
    spec: &ResourceSpec,
    outputs: &BTreeMap<NodeId, Outputs>,
) -> std::result::Result<Outputs, WorkflowError> {
    spec.attributes
        .iter()
        .map(|(name, value)| Ok((name.clone(), resolve_value(spec, value, outputs)?)))
        .collect()
}

fn resolve_value(
    spec: &ResourceSpec,
    value: &AttributeValue,
    outputs: &BTreeMap<NodeId, Outputs>,
) -> std::result::Result<Value, WorkflowError> {
    match value {
        AttributeValue::Literal(literal) => Ok(literal.clone()),
        AttributeValue::Reference(reference) => {
            let Some(produced) = outputs.get(&reference.node) else {
                return Err(WorkflowError::DependencyNotApplied {
                    node: spec.id.clone(),
                    dependency: reference.node.clone(),
                });
            };
            produced
                .get(&reference.attribute)
                .cloned()
                .ok_or_else(|| WorkflowError::MissingOutput {
                    node: spec.id.clone(),
                    reference: reference.clone(),
                })
        }
        AttributeValue::List(items) => items
            .iter()
            .map(|item| resolve_value(spec, item, outputs))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        AttributeValue::Map(entries) => entries
            .iter()
            .map(|(key, item)| Ok((key.clone(), resolve_value(spec, item, outputs)?)))
            .collect::<std::result::Result<Map<_, _>, _>>()
            .map(Value::Object),
    }
}

/// Digest of what the manifest declares for a node, before any resolution.
#[must_use]
pub fn declaration_digest(spec: &ResourceSpec) -> String {
    let mut depends_on: Vec<&str> = spec.depends_on.iter().map(|id| id.as_str()).collect();
    depends_on.sort_unstable();
    depends_on.dedup();

    let attributes: Map<String, Value> = spec
        .attributes
        .iter()
        .map(|(name, value)| (name.clone(), canonical_attribute(value)))
        .collect();

    let mut document = Map::new();
    document.insert("kind".to_string(), Value::from(spec.kind.as_str()));
    document.insert("phase".to_string(), Value::from(spec.phase.as_str()));
    document.insert("attributes".to_string(), Value::Object(attributes));
    document.insert(
        "depends_on".to_string(),
        Value::Array(depends_on.into_iter().map(Value::from).collect()),
    );
    sha256_bytes(Value::Object(document).to_string().as_bytes())
}

/// Digest of resolved inputs. Changes whenever an upstream output changes.
#[must_use]
pub fn input_digest(inputs: &Outputs) -> String {
    let document: Map<String, Value> = inputs
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    sha256_bytes(Value::Object(document).to_string().as_bytes())
}

pub(crate) fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn canonical_attribute(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Literal(literal) => literal.clone(),
        AttributeValue::Reference(reference) => {
            let mut marker = Map::new();
            marker.insert("$ref".to_string(), Value::from(reference.node.as_str()));
            marker.insert("$attr".to_string(), Value::from(reference.attribute.as_str()));
            Value::Object(marker)
        }
        AttributeValue::List(items) => Value::Array(items.iter().map(canonical_attribute).collect()),
        AttributeValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), canonical_attribute(item)))
                .collect(),
        ),
    }
}
