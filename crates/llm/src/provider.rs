//! Backend client for a single worker node.
//!
//! Every node exposes the same OpenAI-compatible surface; one `NodeProvider`
//! is constructed per discovered node and owns that node's URL and auth. The
//! client performs no retries of its own; retry policy belongs to the
//! dispatch layer, which may prefer a different node.

use std::time::{Duration, Instant};

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, StatusCode, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::openai,
    translate::stream::ChunkStream,
};

/// Client for one worker node's OpenAI-compatible API.
#[derive(Clone)]
pub struct NodeProvider {
    client: Client,
    node_id: String,
    base_url: String,
    api_key: Option<SecretString>,
    probe_path: String,
    cache_status_path: String,
}

/// Result of a successful liveness probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    /// Round-trip time of the probe.
    pub latency: Duration,
    /// Context window reported by the node, when the body carries one.
    pub context_window: Option<u32>,
}

/// A node's self-reported KV-cache state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Hash of the system prompt whose prefix the node holds.
    pub system_prompt_hash: String,
    /// Cached prefix length in tokens.
    pub tokens: u32,
    /// Optional cache hit rate since startup.
    #[serde(default)]
    pub hit_rate: Option<f64>,
}

impl NodeProvider {
    /// Build a provider for the node at `url`.
    pub fn new(node_id: impl Into<String>, url: &Url, config: &config::LlmConfig) -> Self {
        Self {
            client: http_client(),
            node_id: node_id.into(),
            base_url: url.as_str().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            probe_path: config.probe_path.clone(),
            cache_status_path: config.cache_status_path.clone(),
        }
    }

    /// The node this provider talks to.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret())),
            None => builder,
        }
    }

    /// Non-streaming chat completion, used for warm-up and smoke calls.
    pub async fn chat_completion(
        &self,
        request: &openai::ChatRequest,
        timeout: Duration,
    ) -> crate::Result<openai::ChatResponse> {
        let body =
            sonic_rs::to_vec(request).map_err(|e| LlmError::InvalidRequest(format!("Failed to serialize request: {e}")))?;

        let response = self
            .authorize(self.client.post(self.endpoint("/v1/chat/completions")))
            .header("Content-Type", "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| connection_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Node {} completion error ({status}): {error_text}", self.node_id);
            return Err(error_from_status(status, error_text));
        }

        let response_text = response.text().await.map_err(|e| {
            log::error!("Failed to read completion body from node {}: {e}", self.node_id);
            LlmError::InternalError(None)
        })?;

        sonic_rs::from_str(&response_text).map_err(|e| {
            log::error!("Failed to parse completion response from node {}: {e}", self.node_id);
            LlmError::InternalError(None)
        })
    }

    /// Streaming chat completion. The returned stream yields parsed chunks;
    /// the `[DONE]` marker ends it. No overall deadline is set here, since
    /// the translator's watchdog bounds upstream silence.
    pub async fn chat_completion_stream(&self, mut request: openai::ChatRequest) -> crate::Result<ChunkStream> {
        request.stream = Some(true);

        let body =
            sonic_rs::to_vec(&request).map_err(|e| LlmError::InvalidRequest(format!("Failed to serialize request: {e}")))?;

        let response = self
            .authorize(self.client.post(self.endpoint("/v1/chat/completions")))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("Failed to open stream: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Node {} streaming error ({status}): {error_text}", self.node_id);
            return Err(error_from_status(status, error_text));
        }

        let node_id = self.node_id.clone();
        let chunk_stream = response.bytes_stream().eventsource().filter_map(move |event| {
            let node_id = node_id.clone();

            async move {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        return Some(Err(LlmError::ConnectionError(format!(
                            "SSE error from node {node_id}: {error}"
                        ))));
                    }
                };

                if event.data == "[DONE]" {
                    return None;
                }

                match sonic_rs::from_str::<openai::ChatChunk>(&event.data) {
                    Ok(chunk) => Some(Ok(chunk)),
                    Err(error) => {
                        // A malformed chunk is dropped rather than killing
                        // the stream; the translator still terminates.
                        log::warn!("Failed to parse streaming chunk from node {node_id}: {error}");
                        None
                    }
                }
            }
        });

        Ok(chunk_stream.boxed())
    }

    /// Liveness probe. Any 2xx with a parseable JSON body counts as success;
    /// the context window is surfaced when the body reports one.
    pub async fn probe(&self, timeout: Duration) -> crate::Result<ProbeReport> {
        let started = Instant::now();

        let response = self
            .authorize(self.client.get(self.endpoint(&self.probe_path)))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| connection_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(error_from_status(status, error_text));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("Unparseable probe body: {e}")))?;

        Ok(ProbeReport {
            latency: started.elapsed(),
            context_window: extract_context_window(&body),
        })
    }

    /// Query the node's current KV-cache state. A missing endpoint means the
    /// node does not report cache state; that is not an error.
    pub async fn cache_status(&self, timeout: Duration) -> crate::Result<Option<CacheStatus>> {
        let response = self
            .authorize(self.client.get(self.endpoint(&self.cache_status_path)))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| connection_error(e, timeout))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(error_from_status(status, error_text));
        }

        let cache_status = response
            .json()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("Unparseable cache status: {e}")))?;

        Ok(Some(cache_status))
    }

    /// Prime the node's KV-cache with the fleet's system prompt. One token of
    /// output is enough to force prefix processing.
    pub async fn warm_up(&self, model: &str, system_prompt: &str, timeout: Duration) -> crate::Result<()> {
        let request = openai::ChatRequest {
            model: model.to_string(),
            messages: vec![
                openai::ChatMessage::text(openai::Role::System, system_prompt),
                openai::ChatMessage::text(openai::Role::User, "ok"),
            ],
            max_completion_tokens: Some(1),
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
            stream_options: None,
            tools: None,
            tool_choice: None,
            user: None,
        };

        self.chat_completion(&request, timeout).await.map(|_| ())
    }
}

fn connection_error(error: reqwest::Error, timeout: Duration) -> LlmError {
    if error.is_timeout() {
        LlmError::UpstreamTimeout(timeout)
    } else {
        LlmError::ConnectionError(error.to_string())
    }
}

fn error_from_status(status: StatusCode, error_text: String) -> LlmError {
    match status.as_u16() {
        401 => LlmError::AuthenticationFailed(error_text),
        404 => LlmError::ModelNotFound(error_text),
        429 => LlmError::RateLimitExceeded { message: error_text },
        400 => LlmError::InvalidRequest(error_text),
        500 => LlmError::InternalError(Some(error_text)),
        _ => LlmError::WorkerApiError {
            status: status.as_u16(),
            message: error_text,
        },
    }
}

/// The context window field differs per runtime; take the first one present
/// in priority order.
fn extract_context_window(body: &serde_json::Value) -> Option<u32> {
    let first = body.get("data")?.get(0)?;

    ["context_length", "loaded_context_length", "max_context_length"]
        .iter()
        .find_map(|field| first.get(field))
        .and_then(serde_json::Value::as_u64)
        .map(|value| value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}")
    }

    fn provider(base: &str) -> NodeProvider {
        let llm_config = config::LlmConfig {
            api_key: Some(SecretString::from("test-key".to_string())),
            ..Default::default()
        };
        NodeProvider::new("w0", &Url::parse(base).unwrap(), &llm_config)
    }

    #[test]
    fn context_window_priority_order() {
        let body = json!({"data": [{
            "id": "m",
            "max_context_length": 4096,
            "loaded_context_length": 8192,
            "context_length": 131072
        }]});
        assert_eq!(extract_context_window(&body), Some(131072));

        let body = json!({"data": [{"id": "m", "max_context_length": 4096, "loaded_context_length": 8192}]});
        assert_eq!(extract_context_window(&body), Some(8192));

        let body = json!({"data": [{"id": "m"}]});
        assert_eq!(extract_context_window(&body), None);

        let body = json!({"status": "ok"});
        assert_eq!(extract_context_window(&body), None);
    }

    #[tokio::test]
    async fn probe_reports_context_window_and_sends_auth() {
        async fn models(headers: HeaderMap) -> impl IntoResponse {
            assert_eq!(headers.get("authorization").unwrap(), "Bearer test-key");
            Json(json!({"data": [{"id": "qwen3-32b", "context_length": 32768}]}))
        }

        let base = serve(Router::new().route("/v1/models", get(models))).await;
        let report = provider(&base).probe(Duration::from_secs(2)).await.unwrap();

        assert_eq!(report.context_window, Some(32768));
        assert!(report.latency > Duration::ZERO);
    }

    #[tokio::test]
    async fn missing_cache_endpoint_is_not_an_error() {
        let base = serve(Router::new()).await;
        let status = provider(&base).cache_status(Duration::from_secs(2)).await.unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn cache_status_parses_camel_case() {
        async fn cache() -> impl IntoResponse {
            Json(json!({"systemPromptHash": "abc123", "tokens": 4096, "hitRate": 0.93}))
        }

        let base = serve(Router::new().route("/v1/cluster/cache", get(cache))).await;
        let status = provider(&base)
            .cache_status(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.system_prompt_hash, "abc123");
        assert_eq!(status.tokens, 4096);
        assert_eq!(status.hit_rate, Some(0.93));
    }

    #[tokio::test]
    async fn rate_limited_node_maps_to_rate_limit_error() {
        async fn completions() -> impl IntoResponse {
            (StatusCode::TOO_MANY_REQUESTS, "slow down")
        }

        let base = serve(Router::new().route("/v1/chat/completions", post(completions))).await;

        let request = openai::ChatRequest {
            model: "qwen3-32b".to_string(),
            messages: vec![openai::ChatMessage::text(openai::Role::User, "hi")],
            max_completion_tokens: Some(8),
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
            stream_options: None,
            tools: None,
            tool_choice: None,
            user: None,
        };

        let error = provider(&base)
            .chat_completion(&request, Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::RateLimitExceeded { .. }), "{error}");
    }

    #[tokio::test]
    async fn streaming_parses_chunks_until_done() {
        async fn completions() -> impl IntoResponse {
            let body = concat!(
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: not-json\n\n",
                "data: [DONE]\n\n",
            );
            ([("content-type", "text/event-stream")], body)
        }

        let base = serve(Router::new().route("/v1/chat/completions", post(completions))).await;

        let request = openai::ChatRequest {
            model: "qwen3-32b".to_string(),
            messages: vec![openai::ChatMessage::text(openai::Role::User, "hi")],
            max_completion_tokens: Some(8),
            temperature: None,
            top_p: None,
            stop: None,
            stream: Some(true),
            stream_options: None,
            tools: None,
            tool_choice: None,
            user: None,
        };

        let chunks: Vec<_> = provider(&base)
            .chat_completion_stream(request)
            .await
            .unwrap()
            .collect()
            .await;

        // The malformed chunk is dropped, the [DONE] marker ends the stream.
        assert_eq!(chunks.len(), 2);
        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("Hel"));
        let second = chunks[1].as_ref().unwrap();
        assert_eq!(second.choices[0].finish_reason, Some(openai::FinishReason::Stop));
    }
}
