//! Translation between the Anthropic Messages protocol and the OpenAI Chat
//! Completions protocol.
//!
//! `request` maps an inbound Messages request onto the chat-completion shape
//! the worker nodes accept. `stream` converts the worker's chunk stream back
//! into the Messages event sequence, enforcing the terminal-event and
//! backpressure guarantees clients depend on.

pub mod request;
pub mod stream;
