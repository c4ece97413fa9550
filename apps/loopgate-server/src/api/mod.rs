pub mod activation;
pub mod admin;
pub mod guardrail;
pub mod meta;
pub mod tasks;

use axum::http::HeaderMap;

pub(crate) const ACTOR_HEADER: &str = "x-loopgate-actor";
const DEFAULT_ACTOR: &str = "local";

/// Caller identity. Authentication happens upstream; the header is trusted.
pub(crate) fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

pub(crate) fn header_str(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
