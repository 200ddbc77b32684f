use futures::stream::{self, StreamExt};
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::error::ChatError;
use crate::llm::{ChatModel, TextStream};
use crate::message::{FunctionCall, Message};

/// Sent when the model answers with neither text nor a function call.
pub const FALLBACK_ANSWER: &str = "Please retry your request there was a backend error.";

/// Delay bounds for replaying a finished answer word by word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Pacing {
    pub const NONE: Pacing = Pacing {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(10),
            max: Duration::from_millis(30),
        }
    }
}

/// Runs one chat turn: ask the model, maybe call a data function, stream the answer.
pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    dispatcher: Dispatcher,
    system_prompt: String,
    pacing: Pacing,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        dispatcher: Dispatcher,
        system_prompt: impl Into<String>,
        pacing: Pacing,
    ) -> Self {
        Self {
            model,
            dispatcher,
            system_prompt: system_prompt.into(),
            pacing,
        }
    }

    /// Every failure is returned before the stream is handed out; once `Ok`,
    /// only a broken provider stream can still fail.
    pub async fn handle(&self, history: Vec<Message>) -> Result<TextStream, ChatError> {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(Message::system(self.system_prompt.as_str()));
        messages.extend(history);

        // STEP 1: let the model choose between answering and calling a function.
        let functions = self.dispatcher.catalog().functions();
        let reply = self
            .model
            .complete(&messages, &functions)
            .await
            .map_err(|e| {
                error!("Error calling the LLM: {:#}", e);
                ChatError::UpstreamLlm(e)
            })?;

        match reply.function_call {
            Some(call) => self.answer_with_function(messages, call).await,
            None => {
                info!("Brain answered directly, no function needed.");
                let content = reply
                    .content
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| FALLBACK_ANSWER.to_string());
                Ok(paced_words(&content, self.pacing))
            }
        }
    }

    async fn answer_with_function(
        &self,
        mut messages: Vec<Message>,
        call: FunctionCall,
    ) -> Result<TextStream, ChatError> {
        info!("Brain decided to call function: '{}'", call.name);
        info!("Arguments: {}", call.arguments);

        // STEP 2: the arguments must be a JSON object before anything goes out.
        let arguments: Map<String, Value> = serde_json::from_str(&call.arguments).map_err(|e| {
            error!("Brain produced malformed arguments for '{}': {}", call.name, e);
            ChatError::MalformedFunctionArguments(e)
        })?;

        // STEP 3: one GET against the data API.
        let result = self
            .dispatcher
            .dispatch(&call.name, &arguments)
            .await
            .map_err(|e| {
                error!("Error running function '{}': {}", call.name, e);
                ChatError::from(e)
            })?;
        let content = result.to_string();
        info!("Function '{}' returned {} bytes of JSON", call.name, content.len());

        // STEP 4: hand the result back and relay the model's streamed answer.
        let name = call.name.clone();
        messages.push(Message::function_call(call));
        messages.push(Message::function_result(name, content));

        self.model.complete_stream(&messages).await.map_err(|e| {
            error!("Error opening the LLM response stream: {:#}", e);
            ChatError::UpstreamLlm(e)
        })
    }
}

/// Replays `text` one space-separated word at a time, each followed by a
/// single space, sleeping a random `pacing` delay before every word.
pub fn paced_words(text: &str, pacing: Pacing) -> TextStream {
    let words: Vec<String> = text.split(' ').map(|word| format!("{word} ")).collect();

    stream::iter(words)
        .then(move |word| async move {
            tokio::time::sleep(pacing.sample()).await;
            Ok(word)
        })
        .boxed()
}
