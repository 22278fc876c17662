//! Streaming chat completions against an OpenAI-compatible endpoint.

use crate::error::{Result, TutorError};
use crate::ingest::RuleContent;
use crate::lesson::{IMAGE_MODE_RULES, IMAGE_PREAMBLE, system_prompt};
use crate::message_log::ContextTurn;
use crate::settings::{BuiltinProviders, SettingsStore};
use crate::sse::{SseDecoder, SseEvent};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use rulebook_types::{ChatCompletionChunk, ChatCompletionRequest, ChatMessage, Role};
use secrecy::ExposeSecret;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const TEMPERATURE: f32 = 0.7;

/// Text fragments of one reply, in order. Single pass: it cannot be restarted.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Sends `context` with the rulebook and streams the reply.
    async fn complete(&self, context: &[ContextTurn], rules: &RuleContent)
    -> Result<FragmentStream>;
}

/// Lays out the request messages.
///
/// Text rules go inline into the system prompt. Image rules leave a
/// placeholder in the system prompt and travel as attachments of a synthetic
/// first user turn, ahead of the real conversation.
pub fn build_messages(context: &[ContextTurn], rules: &RuleContent) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(context.len() + 2);
    match rules {
        RuleContent::Text { content } => {
            messages.push(ChatMessage::system(&system_prompt(content)));
        }
        RuleContent::Images { pages } => {
            messages.push(ChatMessage::system(&system_prompt(IMAGE_MODE_RULES)));
            let attachments = pages
                .iter()
                .fold(ChatMessage::builder(Role::User).with_text(IMAGE_PREAMBLE), |b, url| {
                    b.with_image_url(url)
                });
            messages.push(attachments.build());
        }
    }
    messages.extend(
        context
            .iter()
            .map(|turn| ChatMessage::text(turn.role, &turn.content)),
    );
    messages
}

/// Chat client that resolves the active provider from the settings on every
/// call, so a provider switch applies to the next turn.
pub struct OpenAiChatClient {
    client: Client,
    settings: Arc<SettingsStore>,
    builtins: BuiltinProviders,
}

impl OpenAiChatClient {
    pub fn new(settings: Arc<SettingsStore>, builtins: BuiltinProviders) -> Result<Self> {
        // Only connecting is bounded; a total timeout would cut long replies.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            settings,
            builtins,
        })
    }
}

#[async_trait]
impl ChatCompletion for OpenAiChatClient {
    async fn complete(
        &self,
        context: &[ContextTurn],
        rules: &RuleContent,
    ) -> Result<FragmentStream> {
        let endpoint = self.settings.snapshot().await.ai.resolve(&self.builtins);
        if endpoint.base_url.is_empty() || endpoint.model.is_empty() {
            return Err(TutorError::Completion(
                "no chat endpoint or model configured".to_string(),
            ));
        }

        let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let body = ChatCompletionRequest::streaming(&endpoint.model, build_messages(context, rules))
            .with_temperature(TEMPERATURE);
        tracing::debug!(
            "Requesting completion from {} ({}), {} context turns",
            url,
            endpoint.model,
            context.len()
        );

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TutorError::Completion(format!("{status}: {text}")));
        }

        Ok(fragments(response.bytes_stream().boxed()))
    }
}

struct FragmentState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

impl FragmentState {
    fn absorb(&mut self, events: Vec<SseEvent>) {
        for event in events {
            match event {
                SseEvent::Done => {
                    self.finished = true;
                    return;
                }
                SseEvent::Data(data) => match serde_json::from_str::<ChatCompletionChunk>(&data) {
                    Ok(chunk) => {
                        if let Some(text) = chunk.delta_text() {
                            self.pending.push_back(text.to_string());
                        }
                    }
                    Err(e) => tracing::debug!("Skipping unparseable stream event: {}", e),
                },
            }
        }
    }
}

/// Turns an SSE response body into text fragments.
fn fragments(body: BoxStream<'static, reqwest::Result<Bytes>>) -> FragmentStream {
    let state = FragmentState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.feed(&chunk);
                    state.absorb(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(TutorError::Completion(e.to_string())), state));
                }
                None => {
                    let events = state.decoder.finish();
                    state.absorb(events);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
