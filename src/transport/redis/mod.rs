//! Redis protocol transports.
//!
//! This module contains the Redis Pub/Sub transport (redis.rs), built with
//! the `transport_redis` feature. Without the feature the factory is a stub
//! that reports the missing feature.

#[cfg(feature = "transport_redis")]
#[allow(clippy::module_inception)]
mod redis;

#[cfg(feature = "transport_redis")]
pub use redis::create_transport as create_redis_transport;

#[cfg(not(feature = "transport_redis"))]
pub async fn create_redis_transport(
    _config: crate::TransportConfig,
) -> crate::Result<crate::TransportPtr> {
    Err(crate::PubSubError::Transport(
        "transport_redis feature is not enabled".into(),
    ))
}
