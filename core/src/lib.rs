//! Chat orchestration for the BeraChat gateway: the function catalog, the
//! data-API dispatcher, the LLM client and the per-client rate limiter.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod llm;
pub mod message;
pub mod orchestrator;
pub mod ratelimit;
pub mod registry;

pub use config::Settings;
pub use dispatcher::{DispatchError, Dispatcher};
pub use error::ChatError;
pub use llm::{AssistantReply, Brain, ChatModel, TextStream};
pub use message::{FunctionCall, Message, Role};
pub use orchestrator::{Orchestrator, Pacing};
pub use ratelimit::{RateLimitDecision, RateLimiter, SlidingWindow};
pub use registry::{Catalog, FunctionSpec};
