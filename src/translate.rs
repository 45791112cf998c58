use crate::models::{CompletionResult, StreamEvent, UsageStats};
use crate::upstream::UpstreamError;
use crate::wire::{UpstreamChunk, UpstreamResponse, UpstreamUsage};

const FALLBACK_ID: &str = "chatcmpl-local";

pub fn usage_stats(usage: Option<&UpstreamUsage>) -> UsageStats {
    let Some(usage) = usage else {
        return UsageStats::default();
    };
    let reasoning_tokens = usage
        .completion_tokens_details
        .as_ref()
        .and_then(|d| d.reasoning_tokens)
        .or(usage.reasoning_tokens)
        .unwrap_or(0);
    UsageStats {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        reasoning_tokens,
    }
}

/// Splits the first choice of a provider response into reasoning and answer.
pub fn completion_result(resp: UpstreamResponse) -> Result<CompletionResult, UpstreamError> {
    let usage = usage_stats(resp.usage.as_ref());
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| UpstreamError::Decode("response carried no choices".to_string()))?;
    Ok(CompletionResult {
        id: resp.id.unwrap_or_else(|| FALLBACK_ID.to_string()),
        model: resp.model.unwrap_or_default(),
        reasoning_content: choice.message.reasoning_content,
        content: choice.message.content.unwrap_or_default(),
        usage,
    })
}

/// Maps provider chunks to outward events, one chunk at a time.
#[derive(Debug, Default)]
pub struct StreamTranslator {
    id: Option<String>,
    model: Option<String>,
    usage: Option<UsageStats>,
    reasoning_chars: usize,
    content_chars: usize,
    chunks: u64,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &UpstreamChunk) -> Vec<StreamEvent> {
        self.chunks += 1;
        if self.id.is_none() {
            self.id = chunk.id.clone();
        }
        if self.model.is_none() {
            self.model = chunk.model.clone();
        }
        if chunk.usage.is_some() {
            self.usage = Some(usage_stats(chunk.usage.as_ref()));
        }

        let mut events = Vec::new();
        let Some(choice) = chunk.choices.first() else {
            return events;
        };
        if let Some(text) = choice.delta.reasoning_content.as_deref().filter(|t| !t.is_empty()) {
            self.reasoning_chars += text.chars().count();
            events.push(StreamEvent::Reasoning {
                text: text.to_string(),
            });
        }
        if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
            self.content_chars += text.chars().count();
            events.push(StreamEvent::Content {
                text: text.to_string(),
            });
        }
        events
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn reasoning_chars(&self) -> usize {
        self.reasoning_chars
    }

    pub fn content_chars(&self) -> usize {
        self.content_chars
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn finish(self) -> StreamEvent {
        StreamEvent::Done { usage: self.usage }
    }
}
