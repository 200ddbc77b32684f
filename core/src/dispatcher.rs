use anyhow::{bail, Context};
use reqwest::{StatusCode, Url};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::{Catalog, ExtraArguments, OperationDescriptor, Placement};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("operation '{name}' takes a single path argument, got {count}")]
    ExtraArguments { name: String, count: usize },

    #[error("cannot build URL for '{name}': {reason}")]
    InvalidUrl { name: String, reason: String },

    #[error("data endpoint unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("data endpoint returned HTTP {status}")]
    Upstream { status: StatusCode },

    #[error("data endpoint returned a body that is not JSON: {0}")]
    InvalidBody(#[source] reqwest::Error),
}

/// Turns a function name plus arguments into one HTTP call against the data API.
#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    base_url: Url,
    catalog: Arc<Catalog>,
}

impl Dispatcher {
    pub fn new(base_url: &str, timeout: Duration, catalog: Arc<Catalog>) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid data API base URL '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            bail!("data API base URL '{base_url}' cannot carry a path");
        }
        // Url::join replaces the last segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build data API client")?;

        Ok(Self {
            http,
            base_url,
            catalog,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Builds the target URL for `op`. Does no I/O.
    pub fn resolve_url(
        &self,
        op: &OperationDescriptor,
        arguments: &Map<String, Value>,
    ) -> Result<Url, DispatchError> {
        let invalid = |reason: String| DispatchError::InvalidUrl {
            name: op.name.clone(),
            reason,
        };

        let mut url = self
            .base_url
            .join(op.path.trim_start_matches('/'))
            .map_err(|e| invalid(e.to_string()))?;

        match op.placement {
            Placement::Query => {
                if !arguments.is_empty() {
                    let mut pairs = url.query_pairs_mut();
                    for (key, value) in arguments {
                        pairs.append_pair(key, &scalar_text(value));
                    }
                }
            }
            Placement::PathSegment => {
                if arguments.len() > 1 {
                    match op.extra_arguments {
                        ExtraArguments::Ignore => warn!(
                            "'{}' got {} arguments, only the first goes in the path",
                            op.name,
                            arguments.len()
                        ),
                        ExtraArguments::Reject => {
                            return Err(DispatchError::ExtraArguments {
                                name: op.name.clone(),
                                count: arguments.len(),
                            })
                        }
                    }
                }
                if let Some(value) = arguments.values().next() {
                    url.path_segments_mut()
                        .map_err(|_| invalid("URL cannot carry a path".to_string()))?
                        .pop_if_empty()
                        .push(&scalar_text(value));
                }
            }
        }

        Ok(url)
    }

    pub async fn dispatch(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let op = self
            .catalog
            .get(name)
            .ok_or_else(|| DispatchError::UnknownOperation(name.to_string()))?;

        let url = self.resolve_url(op, arguments)?;
        debug!("Dispatching '{}' -> {} {}", name, op.method, url);

        let response = self
            .http
            .request(op.method.clone(), url)
            .send()
            .await
            .map_err(DispatchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Upstream { status });
        }

        response.json::<Value>().await.map_err(DispatchError::InvalidBody)
    }
}

// Strings go in verbatim; anything else, null included, in its JSON text form.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
