// Function calling (as opposed to tool calling) is marked deprecated in
// async-openai, but it is the protocol the chat front-end speaks.
#![allow(deprecated)]

use anyhow::{Context, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionFunctionCall, ChatCompletionFunctions, ChatCompletionFunctionsArgs,
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestFunctionMessage,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        FunctionCall as WireFunctionCall,
    },
    Client,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::info;

use crate::config::LlmSettings;
use crate::error::ChatError;
use crate::message::{FunctionCall, Message, Role};
use crate::registry::FunctionSpec;

/// Incremental answer text, relayed to the caller as it arrives.
pub type TextStream = BoxStream<'static, Result<String, ChatError>>;

/// The first choice of a non-streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantReply {
    pub content: Option<String>,
    pub function_call: Option<FunctionCall>,
}

/// The two calls the orchestrator makes against a chat model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Non-streamed completion. The model may answer in text or ask for at
    /// most one of `functions`.
    async fn complete(&self, messages: &[Message], functions: &[FunctionSpec]) -> Result<AssistantReply>;

    /// Streamed completion with no functions on offer.
    async fn complete_stream(&self, messages: &[Message]) -> Result<TextStream>;
}

/// OpenAI-backed [`ChatModel`].
pub struct Brain {
    client: Client<OpenAIConfig>,
    model: String,
}

impl Brain {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let config = OpenAIConfig::new()
            .with_api_key(&settings.api_key)
            .with_api_base(&settings.api_base);

        // async-openai retries 429/5xx for minutes by default; every failure here is terminal.
        let no_retries = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();
        let client = Client::with_config(config).with_backoff(no_retries);

        info!("Brain connected. Model: {}", settings.model);
        Ok(Self {
            client,
            model: settings.model.clone(),
        })
    }

    pub async fn say_hello(&self) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content("Hello! Reply with 'System Online'.")
                    .build()?,
            )])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        Ok(content)
    }
}

#[async_trait]
impl ChatModel for Brain {
    async fn complete(&self, messages: &[Message], functions: &[FunctionSpec]) -> Result<AssistantReply> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);

        // An empty `functions` array is rejected by the API, so only send it when there is a menu.
        if !functions.is_empty() {
            let functions = functions
                .iter()
                .map(to_request_function)
                .collect::<Result<Vec<_>>>()?;
            builder
                .functions(functions)
                .function_call(ChatCompletionFunctionCall::Auto);
        }
        let request = builder.build()?;

        let response = self.client.chat().create(request).await?;
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .context("LLM returned no choices")?;

        Ok(AssistantReply {
            content: message.content,
            function_call: message.function_call.map(|call| FunctionCall {
                name: call.name,
                arguments: call.arguments,
            }),
        })
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TextStream> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        // Keep only the text deltas; role and finish markers carry no content.
        let text = stream.filter_map(|chunk| async move {
            match chunk {
                Ok(response) => response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|text| !text.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(ChatError::Stream(e.into()))),
            }
        });

        Ok(text.boxed())
    }
}

fn to_request_message(message: &Message) -> Result<ChatCompletionRequestMessage> {
    let request = match message.role {
        Role::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(message.content.as_str())
                .build()?,
        ),
        Role::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(message.content.as_str())
                .build()?,
        ),
        Role::Assistant => {
            let mut args = ChatCompletionRequestAssistantMessageArgs::default();
            if !message.content.is_empty() {
                args.content(message.content.as_str());
            }
            if let Some(call) = &message.function_call {
                args.function_call(WireFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
            }
            ChatCompletionRequestMessage::Assistant(args.build()?)
        }
        Role::Function => ChatCompletionRequestMessage::Function(ChatCompletionRequestFunctionMessage {
            content: Some(message.content.clone()),
            name: message.name.clone().unwrap_or_default(),
        }),
    };
    Ok(request)
}

fn to_request_function(spec: &FunctionSpec) -> Result<ChatCompletionFunctions> {
    let function = ChatCompletionFunctionsArgs::default()
        .name(&spec.name)
        .description(&spec.description)
        .parameters(spec.parameters.clone()) // Pass the JSON Schema directly
        .build()?;
    Ok(function)
}
