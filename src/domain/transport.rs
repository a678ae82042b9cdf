// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the backend transport contract consumed by the
//! adapter. It intentionally avoids any reference to concrete brokers or
//! client libraries.
//!
//! A transport is responsible only for carrying opaque payloads between
//! every party listening on a channel. Listener bookkeeping, confirmation
//! signaling and fanout to callbacks are handled by the adapter.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::{PubSubError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Default capacity of each subscription inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 64;

/// A broadcast channel name.
///
/// Channels are opaque identifiers. Two channels are equal if and only if
/// their names are byte-identical; no hierarchy or wildcard syntax is
/// implied.
///
/// Channels are immutable, cheap to clone, and safe to share across threads.
///
/// ```
/// # use mom_pubsub::Channel;
/// let a = Channel::from("chat:lobby");
/// let b = Channel::from(String::from("chat:lobby"));
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "chat:lobby");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(pub Arc<str>);

impl Channel {
    /// Borrow the channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Channel
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Channel(value.into())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of delivery from a transport to a subscription inbox.
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Channel the payload was broadcast on.
    pub channel: Channel,

    /// Opaque payload bytes. No schema is imposed.
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(channel: Channel, payload: Bytes) -> Self {
        Self { channel, payload }
    }
}

/// Identifier of one transport-level subscription.
///
/// Unique within the process. Used to release exactly the subscription a
/// handle was created for, even when several subscribers share a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        // ---
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriberId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle returned from a successful transport subscription.
///
/// Envelopes for the channel arrive on `inbox` in the order the transport
/// accepted them. The subscription stays registered with the transport until
/// [`Transport::unsubscribe`] is called with `id`, or the transport closes;
/// dropping the handle only stops consumption and lets the transport evict
/// the subscriber lazily.
///
/// ```no_run
/// # use mom_pubsub::{Channel, TransportBuilder};
/// # async fn example() -> mom_pubsub::Result<()> {
/// let transport = TransportBuilder::new().uri("memory://").node_id("app").build().await?;
///
/// let channel = Channel::from("notifications");
/// let mut handle = transport.subscribe(&channel).await?;
///
/// while let Some(envelope) = handle.inbox.recv().await {
///     println!("received: {:?}", envelope.payload);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SubscriptionHandle {
    // ---
    /// Transport-level subscription id.
    pub id: SubscriberId,

    /// Channel this handle receives.
    pub channel: Channel,

    /// Receiver for envelopes delivered on `channel`.
    pub inbox: mpsc::Receiver<Envelope>,
}

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base` and returns
/// it from [`Transport::base`], so the default trait methods need no
/// per-transport code.
pub struct TransportBase {
    /// Unique identifier for this transport instance (the node_id).
    pub transport_id: String,
    /// Capacity of each subscription inbox.
    pub inbox_capacity: usize,
}

impl TransportBase {
    /// Create a new TransportBase.
    pub fn new(transport_id: impl Into<String>, inbox_capacity: usize) -> Self {
        Self {
            transport_id: transport_id.into(),
            inbox_capacity: inbox_capacity.max(1),
        }
    }
}

impl From<&TransportConfig> for TransportBase {
    fn from(config: &TransportConfig) -> Self {
        // ---
        Self::new(config.node_id.clone(), config.inbox_capacity)
    }
}

/// Configuration for creating a transport instance.
///
/// Produced by [`TransportBuilder`](crate::TransportBuilder) or parsed from
/// JSON with [`TransportConfig::from_json`], and passed to the transport
/// factory functions (`create_*_transport()`).
///
/// ```
/// # use mom_pubsub::TransportConfig;
/// let config = TransportConfig::from_json(
///     r#"{ "uri": "redis://localhost:6379", "node_id": "web-1", "channel_prefix": "app:" }"#,
/// ).unwrap();
/// assert_eq!(config.channel_prefix.as_deref(), Some("app:"));
/// assert_eq!(config.inbox_capacity, mom_pubsub::DEFAULT_INBOX_CAPACITY);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Broker URI (e.g. `"redis://localhost:6379"`, or `"memory://"`).
    #[serde(default)]
    pub uri: String,
    /// Node ID for this transport instance, used for logging.
    pub node_id: String,
    /// Optional transport type override (`"memory"` or `"redis"`).
    /// If `None`, the type is inferred from the URI scheme.
    #[serde(default)]
    pub transport_type: Option<String>,
    /// Prefix applied to every channel name on the broker.
    ///
    /// Lets several applications share one broker without channel clashes.
    /// Ignored by the in-memory transport.
    #[serde(default)]
    pub channel_prefix: Option<String>,
    /// Capacity of each subscription inbox. Publishers wait when it is full.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_inbox_capacity() -> usize {
    DEFAULT_INBOX_CAPACITY
}

impl TransportConfig {
    /// Config for an in-memory transport.
    pub fn memory(node_id: impl Into<String>) -> Self {
        // ---
        Self {
            uri: "memory://".into(),
            node_id: node_id.into(),
            transport_type: Some("memory".into()),
            channel_prefix: None,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    /// Parse a config from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Serialization`] on malformed input and
    /// [`PubSubError::InvalidConfig`] if `inbox_capacity` is zero.
    pub fn from_json(json: &str) -> Result<Self> {
        // ---
        let config: Self = serde_json::from_str(json)?;
        if config.inbox_capacity == 0 {
            return Err(PubSubError::InvalidConfig(
                "inbox_capacity must be greater than zero".into(),
            ));
        }
        Ok(config)
    }
}

/// Backend transport abstraction.
///
/// A `Transport` carries payloads between every subscriber of a channel,
/// within one process or across processes through a broker. Several adapters
/// may share one transport; each transport subscription is independent.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, payloads published *after* that
///   point on the channel are delivered to the returned inbox.
/// - Payloads published by one caller on one channel reach each inbox in the
///   order they were published.
/// - `publish()` does not wait on subscribers processing the payload; it may
///   wait on inbox capacity.
/// - Concurrent `publish`, `subscribe` and `unsubscribe` calls are safe.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat the methods as
/// normal `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the transport_id of the transport.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &Channel, payload: Bytes) -> Result<()>;

    /// Start receiving a channel. Resolves once the subscription is
    /// effective.
    async fn subscribe(&self, channel: &Channel) -> Result<SubscriptionHandle>;

    /// Release one subscription previously returned by `subscribe`.
    ///
    /// Idempotent: releasing an unknown id is not an error.
    async fn unsubscribe(&self, channel: &Channel, id: SubscriberId) -> Result<()>;

    /// Close the transport and release every subscription it created.
    async fn close(&self) -> Result<()>;

    /// Whether the transport can no longer deliver: closed explicitly, or
    /// its broker connection is gone. Inboxes of a closed transport receive
    /// nothing more and new subscriptions fail.
    fn is_closed(&self) -> bool;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones, and multiple adapters, share the same connection
pub type TransportPtr = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn channel_equality_is_byte_equality() {
        assert_eq!(Channel::from("channel"), Channel::from("channel".to_string()));
        assert_ne!(Channel::from("channel"), Channel::from("Channel"));
        assert_ne!(Channel::from("channel"), Channel::from("channel "));
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let a = SubscriberId::next();
        let b = SubscriberId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn config_from_json_applies_defaults() {
        let config = TransportConfig::from_json(r#"{ "node_id": "rx" }"#).unwrap();
        assert_eq!(config.uri, "");
        assert_eq!(config.node_id, "rx");
        assert!(config.transport_type.is_none());
        assert!(config.channel_prefix.is_none());
        assert_eq!(config.inbox_capacity, DEFAULT_INBOX_CAPACITY);
    }

    #[test]
    fn config_from_json_rejects_zero_capacity() {
        let err = TransportConfig::from_json(r#"{ "node_id": "rx", "inbox_capacity": 0 }"#)
            .unwrap_err();
        assert!(matches!(err, PubSubError::InvalidConfig(_)));
    }

    #[test]
    fn config_from_json_reports_malformed_input() {
        let err = TransportConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, PubSubError::Serialization(_)));
    }
}
