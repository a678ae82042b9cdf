//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker-backed transports are hidden behind feature
//! flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod memory;
mod redis;

pub use memory::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    MemoryHub,
};

pub use self::redis::create_redis_transport;

use crate::{PubSubError, Result, TransportConfig, TransportPtr};

/// Transport kinds selectable through `transport_type` or the URI scheme.
const TRANSPORT_TYPES: &str = "memory, redis";

/// Create the transport described by `config`.
///
/// An explicit `transport_type` wins; otherwise the URI scheme decides
/// (`redis://`/`rediss://` select Redis, an empty or `memory://` URI selects
/// the in-memory transport on the process-global hub).
///
/// # Errors
///
/// Returns [`PubSubError::InvalidConfig`] for an unknown type or scheme, and
/// any error raised by the selected transport factory.
pub async fn create_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---
    let kind = match config.transport_type.as_deref() {
        Some(kind) => kind.to_string(),
        None => infer_transport_type(&config.uri)?.to_string(),
    };

    match kind.as_str() {
        "memory" => create_memory_transport(config).await,
        "redis" => create_redis_transport(config).await,
        other => Err(PubSubError::InvalidConfig(format!(
            "unrecognized transport_type: {other}, valid values: {TRANSPORT_TYPES}"
        ))),
    }
}

fn infer_transport_type(uri: &str) -> Result<&'static str> {
    // ---
    let scheme = uri.split_once("://").map(|(scheme, _)| scheme);

    match scheme {
        None if uri.is_empty() => Ok("memory"),
        Some("memory") => Ok("memory"),
        Some("redis") | Some("rediss") | Some("redis+unix") => Ok("redis"),
        _ => Err(PubSubError::InvalidConfig(format!(
            "cannot infer transport from uri {uri:?}, valid types: {TRANSPORT_TYPES}"
        ))),
    }
}
