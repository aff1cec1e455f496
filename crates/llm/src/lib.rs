//! Anthropic↔OpenAI translation layer for the Hive proxy.
//!
//! This crate owns the protocol models for both APIs, the streaming
//! translator that converts an OpenAI chat-completion chunk stream into the
//! Anthropic Messages event sequence, request fingerprinting for
//! cache-affinity routing, the per-node backend client, and the tool-call
//! parser registry with its circuit breaker.

mod error;
mod fingerprint;
mod http_client;
pub mod messages;
pub mod parsers;
pub mod provider;
pub mod translate;

pub use error::{LlmError, LlmResult as Result, MessagesErrorResponse};
pub use fingerprint::{CacheMarkers, Fingerprint, system_prompt_hash};
pub use http_client::http_client;
