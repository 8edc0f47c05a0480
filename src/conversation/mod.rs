pub mod error;

pub use error::GenerationError;

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::inference::{GenerationParameters, LanguageModel};
use crate::prompts::{build_prompt, Markers, Prompt, PromptTemplate};

const END_OF_TEXT: &str = "<|endoftext|>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub response: String,
}

/// What to do with a missing or blank `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyMessagePolicy {
    /// Fail with `MissingInput` before any model work.
    #[default]
    Reject,
    /// Build the prompt anyway; an absent message becomes `""`.
    Forward,
}

impl EmptyMessagePolicy {
    pub fn admit(self, message: Option<String>) -> Result<String, GenerationError> {
        let message = message.unwrap_or_default();
        if message.trim().is_empty() && self == EmptyMessagePolicy::Reject {
            return Err(GenerationError::MissingInput);
        }
        Ok(message)
    }
}

impl FromStr for EmptyMessagePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(EmptyMessagePolicy::Reject),
            "forward" => Ok(EmptyMessagePolicy::Forward),
            other => Err(anyhow!(
                "unknown empty message policy `{other}` (expected `reject` or `forward`)"
            )),
        }
    }
}

impl fmt::Display for EmptyMessagePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyMessagePolicy::Reject => f.write_str("reject"),
            EmptyMessagePolicy::Forward => f.write_str("forward"),
        }
    }
}

/// One request in, one reply out. Holds no per-conversation state.
pub struct ChatPipeline {
    model: Arc<dyn LanguageModel>,
    template: PromptTemplate,
    params: GenerationParameters,
    empty_message: EmptyMessagePolicy,
}

impl ChatPipeline {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        template: PromptTemplate,
        params: GenerationParameters,
        empty_message: EmptyMessagePolicy,
    ) -> Self {
        Self {
            model,
            template,
            params,
            empty_message,
        }
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    pub async fn respond(&self, message: Option<String>) -> Result<ChatResponse, GenerationError> {
        let message = self.empty_message.admit(message)?;
        let prompt = build_prompt(self.template, &message);

        let model = Arc::clone(&self.model);
        let params = self.params.clone();
        let started = Instant::now();

        let result =
            tokio::task::spawn_blocking(move || generate_reply(model.as_ref(), &prompt, &params))
                .await
                .map_err(join_failure)?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(reply) => info!(
                target: "conversation",
                elapsed_ms,
                reply_chars = reply.response.chars().count(),
                "chat reply generated"
            ),
            Err(err) => warn!(target: "conversation", elapsed_ms, error = %err, "chat turn failed"),
        }
        result
    }
}

/// Encode, sample, decode and extract. Blocking; a single attempt.
pub fn generate_reply(
    model: &dyn LanguageModel,
    prompt: &Prompt,
    params: &GenerationParameters,
) -> Result<ChatResponse, GenerationError> {
    let tokens = model
        .encode(prompt.text())
        .map_err(GenerationError::processing)?;

    let budget = model
        .max_context()
        .saturating_sub(params.max_new_tokens)
        .max(1);
    let prompt_tokens = tokens.len();
    let tokens = keep_tail(tokens, budget);
    if tokens.len() < prompt_tokens {
        warn!(
            target: "conversation",
            prompt_tokens,
            kept = tokens.len(),
            "prompt exceeds context, dropping leading persona tokens"
        );
    }

    let output = model
        .generate(&tokens, params)
        .map_err(GenerationError::processing)?;
    let raw = model.decode(&output).map_err(GenerationError::processing)?;
    debug!(target: "conversation", raw_chars = raw.len(), "decoded completion");

    let response = extract_reply(&raw, prompt.markers()).inspect_err(|_| {
        warn!(
            target: "conversation",
            raw_chars = raw.len(),
            "completion held no reply after the response marker"
        )
    })?;

    Ok(ChatResponse { response })
}

/// Reply = text after the last response marker, cut at the next marker or
/// end-of-text literal, trimmed. Empty or unmarked completions fail.
pub fn extract_reply(raw: &str, markers: Markers) -> Result<String, GenerationError> {
    let start = raw
        .rfind(markers.response)
        .ok_or(GenerationError::GenerationFailed)?
        + markers.response.len();

    let reply = trim_at_stop(&raw[start..], &[markers.user, markers.response, END_OF_TEXT]).trim();
    if reply.is_empty() {
        return Err(GenerationError::GenerationFailed);
    }
    Ok(reply.to_string())
}

fn trim_at_stop<'a>(text: &'a str, stops: &[&str]) -> &'a str {
    let end = stops
        .iter()
        .filter_map(|seq| text.find(seq))
        .min()
        .unwrap_or(text.len());
    &text[..end]
}

fn keep_tail(mut tokens: Vec<u32>, budget: usize) -> Vec<u32> {
    if tokens.len() <= budget {
        return tokens;
    }
    tokens.drain(0..tokens.len() - budget);
    tokens
}

fn join_failure(err: JoinError) -> GenerationError {
    if err.is_panic() {
        let reason = panic_reason(err.into_panic());
        return GenerationError::ProcessingError(reason);
    }
    GenerationError::processing(err)
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "model panicked during generation".to_string())
}
