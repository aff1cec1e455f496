//! The request path: fingerprint, route, dispatch with retries, translate,
//! stream back.

use std::{sync::Arc, time::{Duration, Instant}};

use axum::{
    Router,
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::post,
};
use axum_serde::Sonic;
use cluster::{ClusterManager, SelectedNode};
use futures::StreamExt;
use llm::{
    Fingerprint, LlmError, MessagesErrorResponse,
    messages::anthropic,
    parsers::{
        ParsedResponse, ParserRegistry,
        breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError},
    },
    translate::{self, stream::ChunkStream},
};
use rand::Rng;

struct ProxyState {
    manager: Arc<ClusterManager>,
    parsers: Arc<ParserRegistry>,
    parser_breaker: CircuitBreaker,
    llm_config: config::LlmConfig,
}

/// The client-facing Messages API.
pub(crate) fn router(manager: Arc<ClusterManager>, config: &config::Config) -> Router {
    let state = Arc::new(ProxyState {
        manager,
        parsers: Arc::new(ParserRegistry::with_default_parsers(config.llm.parsers.clone())),
        parser_breaker: CircuitBreaker::new("tool-call-parsers", CircuitBreakerConfig::default()),
        llm_config: config.llm.clone(),
    });

    Router::new().route("/v1/messages", post(messages)).with_state(state)
}

/// Handle `POST /v1/messages`, streaming or buffered per the request.
async fn messages(
    State(state): State<Arc<ProxyState>>,
    Sonic(request): Sonic<anthropic::MessagesRequest>,
) -> Result<Response, MessagesErrorResponse> {
    log::debug!(
        "Messages request for {} ({} message(s), streaming: {})",
        request.model,
        request.messages.len(),
        request.streaming()
    );

    let fingerprint = Fingerprint::of(&request);
    // The caller-supplied user id doubles as the sticky-session key.
    let session_id = request.metadata.as_ref().and_then(|meta| meta.user_id.clone());

    let chat_request = translate::request::to_chat_request(&request);

    let (selected, upstream) = dispatch(&state, &fingerprint, session_id, &chat_request).await?;

    let events = translate::stream::translate(upstream, request.model.clone(), state.llm_config.stream_watchdog);

    if request.streaming() {
        let guard = selected.guard;
        let sse_events = events.map(move |event| {
            // The guard rides with the stream: in-flight accounting covers
            // the whole response, not just the dispatch.
            let _ = &guard;

            let json = sonic_rs::to_string(&event).unwrap_or_else(|error| {
                log::error!("Failed to serialize stream event: {error}");
                r#"{"type":"error","error":{"type":"internal_error","message":"serialization failed"}}"#.to_string()
            });

            Ok::<_, std::convert::Infallible>(Event::default().event(event.name()).data(json))
        });

        let mut response = Sse::new(sse_events).into_response();

        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

        Ok(response)
    } else {
        let mut response = translate::stream::collect(events).await.map_err(|error| {
            state.manager.record_failure(&selected.node_id, &error);
            MessagesErrorResponse::from(error)
        })?;

        drop(selected.guard);

        extract_text_tool_calls(&state, &mut response);

        Ok(axum::Json(response).into_response())
    }
}

/// Pick a node and open the upstream stream, retrying against a different
/// eligible node when one exists. Bounded exponential backoff with jitter
/// between attempts.
async fn dispatch(
    state: &ProxyState,
    fingerprint: &Fingerprint,
    session_id: Option<String>,
    chat_request: &llm::messages::openai::ChatRequest,
) -> Result<(SelectedNode, ChunkStream), MessagesErrorResponse> {
    let retry = &state.llm_config.retry;
    let mut excluded: Vec<String> = Vec::new();
    let mut last_error = LlmError::NoEligibleNode;

    for attempt in 0..retry.max_attempts {
        let selected = state
            .manager
            .select_node(fingerprint, session_id.clone(), &excluded)
            .map_err(|error| {
                log::error!("Node selection failed: {error}");
                MessagesErrorResponse::from(LlmError::InternalError(None))
            })?;

        let Some(selected) = selected else {
            if excluded.is_empty() {
                return Err(MessagesErrorResponse::from(last_error));
            }
            // Every eligible node already failed this request. Lift the
            // exclusions so a remaining attempt may retry the same node.
            excluded.clear();
            continue;
        };

        let started = Instant::now();

        match selected.provider.chat_completion_stream(chat_request.clone()).await {
            Ok(upstream) => {
                state
                    .manager
                    .record_success(&selected.node_id, started.elapsed());
                return Ok((selected, upstream));
            }
            Err(error) => {
                log::warn!(
                    "Dispatch to {} failed on attempt {}: {error}",
                    selected.node_id,
                    attempt + 1
                );
                state.manager.record_failure(&selected.node_id, &error);

                let retryable = error.is_retryable();
                excluded.push(selected.node_id.clone());
                last_error = error;
                drop(selected);

                if !retryable {
                    return Err(MessagesErrorResponse::from(last_error));
                }

                if attempt + 1 < retry.max_attempts {
                    tokio::time::sleep(retry_delay(retry.base_delay, attempt)).await;
                }
            }
        }
    }

    Err(MessagesErrorResponse::from(last_error))
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let backoff = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter_cap = (base.as_millis() as u64 / 2).max(1);
    let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_cap));

    backoff + jitter
}

/// Models without native tool-call support emit tool calls inside their
/// text. When a buffered response carries no structured tool use, run the
/// parser chain over its text and lift any recognized calls into proper
/// `tool_use` blocks. The chain sits behind a circuit breaker: repeated
/// hard-timeouts stop it from being consulted at all, and the raw text
/// stands as the response.
fn extract_text_tool_calls(state: &ProxyState, response: &mut anthropic::MessagesResponse) {
    let has_native_tool_use = response
        .content
        .iter()
        .any(|block| matches!(block, anthropic::ResponseContent::ToolUse { .. }));
    if has_native_tool_use {
        return;
    }

    let text: String = response
        .content
        .iter()
        .filter_map(|block| match block {
            anthropic::ResponseContent::Text { text } => Some(text.as_str()),
            anthropic::ResponseContent::ToolUse { .. } => None,
        })
        .collect();

    if text.is_empty() {
        return;
    }

    let hard_timeout = state.llm_config.parsers.soft_budget * 5;
    let parsers = Arc::clone(&state.parsers);

    match state
        .parser_breaker
        .call(move || parsers.parse_untrusted(text, hard_timeout))
    {
        Ok(ParsedResponse::ToolCalls(calls)) => {
            response.content = calls
                .into_iter()
                .map(|call| anthropic::ResponseContent::ToolUse {
                    id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                    name: call.name,
                    input: call.arguments,
                })
                .collect();
            response.stop_reason = Some(anthropic::StopReason::ToolUse);
        }
        Ok(ParsedResponse::Text(_)) => {}
        Err(CircuitBreakerError::Rejected(name)) => {
            log::warn!("Tool-call parsing skipped: circuit breaker `{name}` is open");
        }
        Err(CircuitBreakerError::Operation(timeout)) => {
            log::warn!("Tool-call parsing abandoned: {timeout}");
        }
    }
}
