use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use berachat_core::{ChatError, Message, RateLimitDecision};
use serde::Deserialize;

pub const RATE_LIMITED: &str = "You have reached your request limit for the day.";
pub const REQUEST_FAILED: &str = "An error occurred while processing your request.";
pub const FUNCTION_FAILED: &str = "An error occurred while processing the function call.";

// Input: the conversation so far, as the chat widget sends it
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
}

// Output on failure. Causes are logged where they happen, never sent to the caller.
#[derive(Debug)]
pub enum ApiError {
    RateLimited(RateLimitDecision),
    Chat(ChatError),
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        ApiError::Chat(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited(decision) => (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("x-ratelimit-limit", decision.limit.to_string()),
                    ("x-ratelimit-remaining", decision.remaining.to_string()),
                    ("x-ratelimit-reset", decision.reset.to_string()),
                ],
                RATE_LIMITED,
            )
                .into_response(),
            ApiError::Chat(e) => {
                let message = if e.is_function_failure() {
                    FUNCTION_FAILED
                } else {
                    REQUEST_FAILED
                };
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}
