use crate::config::Settings;
use crate::models::CompletionRequest;
use crate::wire::{StreamOptions, UpstreamChunk, UpstreamRequest, UpstreamResponse};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::future;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Network(String),
    #[error("upstream status {status}: {body}")]
    Status {
        status: StatusCode,
        code: Option<String>,
        body: String,
    },
    #[error("upstream returned an unreadable body: {0}")]
    Decode(String),
    #[error("upstream stream interrupted: {0}")]
    Interrupted(String),
}

impl UpstreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Network(_) => "network",
            UpstreamError::Status { .. } => "http",
            UpstreamError::Decode(_) => "decode",
            UpstreamError::Interrupted(_) => "interrupted",
        }
    }
}

/// Lazy sequence of provider chunks. Ends at `[DONE]` or when the connection closes;
/// dropping it releases the upstream connection.
pub type ChunkStream = BoxStream<'static, Result<UpstreamChunk, UpstreamError>>;

/// The one outbound client, built at startup and shared by every handler.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    inner: Arc<UpstreamTarget>,
}

struct UpstreamTarget {
    url: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(settings: &Settings) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("reason-relay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| UpstreamError::Network(err.to_string()))?;
        Ok(Self::with_http(http, settings))
    }

    pub fn with_http(http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            http,
            inner: Arc::new(UpstreamTarget {
                url: join_url(&settings.base_url, CHAT_COMPLETIONS_PATH),
                api_key: settings.api_key.clone(),
                model: settings.model_name.clone(),
                request_timeout: settings.request_timeout(),
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let body = self.request_body(req, false);
        let resp = self
            .http
            .post(&self.inner.url)
            .bearer_auth(&self.inner.api_key)
            .timeout(self.inner.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::Network(err.to_string()))?;
        let resp = ensure_success(resp).await?;
        let text = resp
            .text()
            .await
            .map_err(|err| UpstreamError::Network(err.to_string()))?;
        serde_json::from_str(&text).map_err(|err| UpstreamError::Decode(err.to_string()))
    }

    pub async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, UpstreamError> {
        let body = self.request_body(req, true);
        let resp = self
            .http
            .post(&self.inner.url)
            .bearer_auth(&self.inner.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::Network(err.to_string()))?;
        let resp = ensure_success(resp).await?;

        let chunks = resp
            .bytes_stream()
            .eventsource()
            .take_while(|ev| future::ready(!matches!(ev, Ok(ev) if ev.data.trim() == "[DONE]")))
            .filter_map(|ev| {
                future::ready(match ev {
                    Ok(ev) => decode_chunk(&ev.data),
                    Err(err) => Some(Err(UpstreamError::Interrupted(err.to_string()))),
                })
            });
        Ok(chunks.boxed())
    }

    fn request_body<'a>(
        &'a self,
        req: &'a CompletionRequest,
        stream: bool,
    ) -> UpstreamRequest<'a> {
        UpstreamRequest {
            model: &self.inner.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(UpstreamError::Status {
        status,
        code: extract_error_code(&body),
        body,
    })
}

fn decode_chunk(data: &str) -> Option<Result<UpstreamChunk, UpstreamError>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str::<UpstreamChunk>(data) {
        Ok(chunk) => Some(Ok(chunk)),
        Err(err) => {
            tracing::warn!(error = %err, "skipping undecodable upstream chunk");
            None
        }
    }
}

/// Appends `path` to `base` verbatim; version prefixes belong in the configured base.
fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let code = value.get("error").and_then(|v| v.get("code"))?;
    match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
