use anyhow::{bail, Context, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

// Compiled-in copy of tools/catalog.json, used when no override path is configured.
const BUILTIN_CATALOG: &str = include_str!("../../tools/catalog.json");

/// Where a function's arguments go in the outbound URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Every argument becomes a `key=value` query pair, in argument order.
    Query,
    /// The first argument value is appended as a single path segment.
    #[default]
    PathSegment,
}

/// What a `path_segment` operation does when handed more than one argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraArguments {
    /// Use the first value, drop the rest.
    #[default]
    Ignore,
    Reject,
}

// One entry of catalog.json: what the LLM sees plus how to reach the data endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub description: String,

    // JSON Schema for the arguments, handed to the Brain untouched.
    pub parameters: Value,

    #[serde(default = "default_method", with = "http_method")]
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub extra_arguments: ExtraArguments,
}

/// The part of a descriptor offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&OperationDescriptor> for FunctionSpec {
    fn from(op: &OperationDescriptor) -> Self {
        Self {
            name: op.name.clone(),
            description: op.description.clone(),
            parameters: op.parameters.clone(),
        }
    }
}

/// Immutable, ordered list of the functions the Brain may call.
#[derive(Debug, Clone)]
pub struct Catalog {
    operations: Vec<OperationDescriptor>,
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG).context("builtin catalog is invalid")
    }

    // Reads a catalog file and returns the checked list of operations
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read catalog at '{}': {}", path.display(), e))?;

        Self::from_json(&content).with_context(|| format!("invalid catalog at '{}'", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let operations: Vec<OperationDescriptor> = serde_json::from_str(content)?;
        Self::new(operations)
    }

    pub fn new(operations: Vec<OperationDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for op in &operations {
            if !seen.insert(op.name.as_str()) {
                bail!("operation '{}' is declared twice", op.name);
            }
            if op.path.trim_matches('/').is_empty() {
                bail!("operation '{}' has an empty path", op.name);
            }
            sanity_check(op);
        }

        Ok(Self { operations })
    }

    pub fn get(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.iter()
    }

    /// The full catalog in declaration order, as offered to the model.
    pub fn functions(&self) -> Vec<FunctionSpec> {
        self.operations.iter().map(FunctionSpec::from).collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// Schema problems are the model's to trip over, so they only warn.
fn sanity_check(op: &OperationDescriptor) {
    let properties = op.parameters.get("properties").and_then(Value::as_object);
    let required = op
        .parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    for field in required {
        if !properties.is_some_and(|p| p.contains_key(field)) {
            tracing::warn!(
                "Operation '{}' requires '{}' but does not declare it in properties",
                op.name,
                field
            );
        }
    }

    let declared = properties.map_or(0, |p| p.len());
    if op.placement == Placement::PathSegment && declared > 1 {
        tracing::warn!(
            "Operation '{}' declares {} properties but only one fits in the path",
            op.name,
            declared
        );
    }
}

fn default_method() -> Method {
    Method::GET
}

mod http_method {
    use reqwest::Method;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(serde::de::Error::custom)
    }
}
