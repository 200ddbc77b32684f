use thiserror::Error;

use crate::dispatcher::DispatchError;

/// Everything that can end a chat request. None of these are retried.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("LLM request failed: {0}")]
    UpstreamLlm(#[source] anyhow::Error),

    #[error("function call arguments are not a JSON object: {0}")]
    MalformedFunctionArguments(#[source] serde_json::Error),

    #[error("function dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("LLM response stream failed: {0}")]
    Stream(#[source] anyhow::Error),
}

impl ChatError {
    /// True when the failure happened while running the model's chosen function,
    /// as opposed to talking to the model itself.
    pub fn is_function_failure(&self) -> bool {
        matches!(
            self,
            ChatError::MalformedFunctionArguments(_) | ChatError::Dispatch(_)
        )
    }
}
