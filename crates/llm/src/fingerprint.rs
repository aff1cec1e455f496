//! Request fingerprinting for cache-affinity routing.
//!
//! A node that has already processed a given system prompt holds its KV-cache
//! prefix; the router uses the fingerprint hashes to find such nodes. Hashing
//! is deterministic: identical `(system, tools)` pairs always produce
//! identical digests, and tool order is preserved because upstream ordering
//! is semantically meaningful.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::messages::anthropic::{
    CacheControlType, ContentBlock, MessageContent, MessagesRequest, Role, SystemBlock, SystemPrompt, Tool,
};

/// Routing-relevant identity of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// sha256 of the canonical string form of the system prompt.
    pub system_prompt_hash: String,
    /// sha256 of the canonical JSON of the tools array.
    pub tools_hash: String,
    /// Ephemeral cache markers found in the request.
    pub cache_markers: CacheMarkers,
}

/// Aggregated `cache_control: ephemeral` markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMarkers {
    /// Concatenated text of all cacheable blocks.
    pub cacheable_text: String,
    /// Rough token estimate for the cacheable text: ⌈chars / 4⌉.
    pub estimated_tokens: u32,
    /// Number of cacheable blocks found in user messages.
    pub user_block_count: u32,
}

impl Fingerprint {
    /// Compute the fingerprint of a request. Pure, single pass over the
    /// request body.
    pub fn of(request: &MessagesRequest) -> Self {
        let system_text = request.system.as_ref().map(SystemPrompt::canonical_text);

        Self {
            system_prompt_hash: hash_system(system_text.as_deref()),
            tools_hash: hash_tools(request.tools.as_deref()),
            cache_markers: collect_cache_markers(request),
        }
    }
}

/// Hash of a canonical system prompt string, as used for cache-affinity
/// lookups. The same digest the fingerprint carries in `system_prompt_hash`.
pub fn system_prompt_hash(text: &str) -> String {
    hash_system(Some(text))
}

/// Canonical JSON wrapper so the digest covers a stable shape rather than
/// bare strings. `system: null` and missing system hash identically.
#[derive(Serialize)]
struct CanonicalSystem<'a> {
    system: Option<&'a str>,
}

fn hash_system(system: Option<&str>) -> String {
    let canonical = serde_json::to_string(&CanonicalSystem { system }).expect("string serialization cannot fail");

    hex_digest(canonical.as_bytes())
}

#[derive(Serialize)]
struct CanonicalTools<'a> {
    tools: &'a [Tool],
}

fn hash_tools(tools: Option<&[Tool]>) -> String {
    // Absent tools and an empty tools array are the same request shape.
    let tools = tools.unwrap_or(&[]);
    let canonical = serde_json::to_string(&CanonicalTools { tools }).expect("tool serialization cannot fail");

    hex_digest(canonical.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

fn collect_cache_markers(request: &MessagesRequest) -> CacheMarkers {
    let mut markers = CacheMarkers::default();

    if let Some(SystemPrompt::Blocks(blocks)) = &request.system {
        for block in blocks {
            let SystemBlock::Text { text, cache_control } = block;
            if cache_control
                .as_ref()
                .is_some_and(|c| c.cache_type == CacheControlType::Ephemeral)
            {
                markers.cacheable_text.push_str(text);
            }
        }
    }

    for message in &request.messages {
        let MessageContent::Blocks(blocks) = &message.content else {
            continue;
        };

        for block in blocks {
            let ContentBlock::Text { text, cache_control } = block else {
                continue;
            };

            if cache_control
                .as_ref()
                .is_some_and(|c| c.cache_type == CacheControlType::Ephemeral)
            {
                markers.cacheable_text.push_str(text);
                if message.role == Role::User {
                    markers.user_block_count += 1;
                }
            }
        }
    }

    markers.estimated_tokens = estimate_tokens(&markers.cacheable_text);
    markers
}

/// Character-count heuristic, rounded up. Good enough for cache sizing; the
/// nodes report exact counts during sync.
fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}
