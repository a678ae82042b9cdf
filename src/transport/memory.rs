//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended for single-process deployments, tests,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the
//! transport layer. Other transports are expected to approximate it as
//! closely as their underlying systems allow and to document any deviation.
//!
//! - Once `subscribe()` returns successfully, payloads published *after* that
//!   point on the channel are delivered to the returned inbox.
//! - A channel matches only a byte-identical channel name.
//! - Payloads published by one caller reach each inbox in publish order.
//! - No payload is dropped while the inbox is alive; a full inbox makes
//!   `publish()` wait.
//!
//! ## Non-Goals
//!
//! This transport does not emulate the failure modes, persistence, or
//! delivery guarantees of any specific broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::{
    // ---
    log_debug,
    Channel,
    Envelope,
    PubSubError,
    Result,
    SubscriberId,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
};

/// One inbox registered on the hub.
struct HubSubscriber {
    id: SubscriberId,
    // Key of the MemoryTransport that created the subscription.
    owner: u64,
    sender: mpsc::Sender<Envelope>,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a broker within a single process. All memory transports that
/// share a `MemoryHub` receive each other's broadcasts, exactly as nodes
/// connected to one broker would.
///
/// [`create_memory_transport`] uses a process-global hub. Construct a hub
/// explicitly and pass it to [`create_memory_transport_with_hub`] to isolate
/// groups of transports from each other (for example parallel tests):
///
/// ```
/// # use mom_pubsub::{create_memory_transport_with_hub, MemoryHub, TransportConfig};
/// # async fn example() -> mom_pubsub::Result<()> {
/// let hub = MemoryHub::new();
///
/// let rx = create_memory_transport_with_hub(TransportConfig::memory("rx"), hub.clone()).await?;
/// let tx = create_memory_transport_with_hub(TransportConfig::memory("tx"), hub.clone()).await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    subscriptions: RwLock<HashMap<Channel, Vec<HubSubscriber>>>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Number of live transport subscriptions on `channel`.
    pub async fn subscriber_count(&self, channel: &Channel) -> usize {
        self.subscriptions
            .read()
            .await
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Channels with at least one transport subscription.
    pub async fn channels(&self) -> Vec<Channel> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    async fn publish(&self, _transport_id: &str, env: Envelope) -> Result<()> {
        // ---
        // Clone the senders so no hub lock is held while waiting on inbox
        // capacity.
        let senders: Vec<mpsc::Sender<Envelope>> = {
            let subs = self.subscriptions.read().await;
            match subs.get(&env.channel) {
                Some(subscribers) => subscribers.iter().map(|s| s.sender.clone()).collect(),
                None => return Ok(()),
            }
        };

        log_debug!(
            "{_transport_id}: publish to {} ({} subscribers)",
            env.channel,
            senders.len()
        );

        let mut saw_closed = false;
        for sender in senders {
            // A closed inbox belongs to a receive loop that has gone away.
            if sender.send(env.clone()).await.is_err() {
                saw_closed = true;
            }
        }

        if saw_closed {
            self.evict_closed(&env.channel).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _transport_id: &str,
        owner: u64,
        channel: &Channel,
        capacity: usize,
    ) -> SubscriptionHandle {
        // ---
        let id = SubscriberId::next();
        log_debug!("{_transport_id}: subscribe to {channel} ({id})");

        let (tx, rx) = mpsc::channel(capacity);

        let mut subs = self.subscriptions.write().await;
        subs.entry(channel.clone()).or_default().push(HubSubscriber {
            id,
            owner,
            sender: tx,
        });

        SubscriptionHandle {
            id,
            channel: channel.clone(),
            inbox: rx,
        }
    }

    async fn unsubscribe(&self, _transport_id: &str, channel: &Channel, id: SubscriberId) {
        // ---
        log_debug!("{_transport_id}: unsubscribe from {channel} ({id})");

        let mut subs = self.subscriptions.write().await;
        if let Some(subscribers) = subs.get_mut(channel) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                subs.remove(channel);
            }
        }
    }

    /// Drop every subscription created by one transport, leaving other
    /// transports on the hub untouched.
    async fn close_owner(&self, _transport_id: &str, owner: u64) {
        // ---
        log_debug!("{_transport_id}: closing transport...");

        let mut subs = self.subscriptions.write().await;
        subs.retain(|_, subscribers| {
            subscribers.retain(|s| s.owner != owner);
            !subscribers.is_empty()
        });
    }

    async fn evict_closed(&self, channel: &Channel) {
        let mut subs = self.subscriptions.write().await;
        if let Some(subscribers) = subs.get_mut(channel) {
            subscribers.retain(|s| !s.sender.is_closed());
            if subscribers.is_empty() {
                subs.remove(channel);
            }
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

static NEXT_TRANSPORT_KEY: AtomicU64 = AtomicU64::new(1);

/// In-memory transport.
///
/// Routes payloads through a shared [`MemoryHub`]. Closing one transport
/// drops only the subscriptions it created.
struct MemoryTransport {
    // ---
    base: TransportBase,
    hub: Arc<MemoryHub>,
    key: u64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Transport(format!(
                "{}: memory transport is closed",
                self.transport_id()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    /// Publish a payload to every inbox on the channel.
    ///
    /// A channel matches only an identical channel name. This behavior
    /// defines the reference matching semantics for the transport layer.
    async fn publish(&self, channel: &Channel, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.hub
            .publish(self.transport_id(), Envelope::new(channel.clone(), payload))
            .await
    }

    /// Register an inbox on the shared hub.
    ///
    /// Registration is immediate: once this returns, later publishes on the
    /// channel are delivered to the returned inbox.
    async fn subscribe(&self, channel: &Channel) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        Ok(self
            .hub
            .subscribe(
                self.transport_id(),
                self.key,
                channel,
                self.base.inbox_capacity,
            )
            .await)
    }

    async fn unsubscribe(&self, channel: &Channel, id: SubscriberId) -> Result<()> {
        self.hub.unsubscribe(self.transport_id(), channel, id).await;
        Ok(())
    }

    /// Close the transport.
    ///
    /// Drops this transport's subscriptions from the hub; transports sharing
    /// the hub keep theirs. Closing twice is a no-op.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.hub.close_owner(self.transport_id(), self.key).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Create a new in-memory transport using the process-global hub.
///
/// All transports created with this function share a single message bus,
/// matching the semantics of nodes connected to one broker.
///
/// For isolated groups of transports, use [`create_memory_transport_with_hub`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport using the provided hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_hub(
    config: TransportConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{}: create memory transport", config.node_id);

    let transport = MemoryTransport {
        base: TransportBase::from(&config),
        hub,
        key: NEXT_TRANSPORT_KEY.fetch_add(1, Ordering::Relaxed),
        closed: AtomicBool::new(false),
    };

    Ok(Arc::new(transport))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn transport(hub: &Arc<MemoryHub>, node_id: &str) -> TransportPtr {
        create_memory_transport_with_hub(TransportConfig::memory(node_id), hub.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_every_transport_on_the_hub() {
        let hub = MemoryHub::new();
        let rx_a = transport(&hub, "a").await;
        let rx_b = transport(&hub, "b").await;
        let tx = transport(&hub, "tx").await;
        let channel = Channel::from("channel");

        let mut a = rx_a.subscribe(&channel).await.unwrap();
        let mut b = rx_b.subscribe(&channel).await.unwrap();

        tx.publish(&channel, Bytes::from("hello")).await.unwrap();

        for handle in [&mut a, &mut b] {
            let env = timeout(Duration::from_millis(100), handle.inbox.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(env.payload, Bytes::from("hello"));
            assert_eq!(env.channel, channel);
        }
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_subscription() {
        let hub = MemoryHub::new();
        let t = transport(&hub, "t").await;
        let channel = Channel::from("channel");

        let first = t.subscribe(&channel).await.unwrap();
        let mut second = t.subscribe(&channel).await.unwrap();
        assert_eq!(hub.subscriber_count(&channel).await, 2);

        t.unsubscribe(&channel, first.id).await.unwrap();
        t.unsubscribe(&channel, first.id).await.unwrap();
        assert_eq!(hub.subscriber_count(&channel).await, 1);

        t.publish(&channel, Bytes::from("x")).await.unwrap();
        assert!(second.inbox.recv().await.is_some());
    }

    #[tokio::test]
    async fn close_keeps_other_transports_subscriptions() {
        let hub = MemoryHub::new();
        let rx = transport(&hub, "rx").await;
        let tx = transport(&hub, "tx").await;
        let channel = Channel::from("channel");

        let mut rx_handle = rx.subscribe(&channel).await.unwrap();
        let _tx_handle = tx.subscribe(&channel).await.unwrap();

        tx.close().await.unwrap();
        tx.close().await.unwrap();
        assert_eq!(hub.subscriber_count(&channel).await, 1);

        assert!(tx.publish(&channel, Bytes::from("x")).await.is_err());

        rx.publish(&channel, Bytes::from("y")).await.unwrap();
        let env = rx_handle.inbox.recv().await.unwrap();
        assert_eq!(env.payload, Bytes::from("y"));
    }

    #[tokio::test]
    async fn dropped_inbox_is_evicted_on_publish() {
        let hub = MemoryHub::new();
        let t = transport(&hub, "t").await;
        let channel = Channel::from("channel");

        drop(t.subscribe(&channel).await.unwrap());
        assert_eq!(hub.subscriber_count(&channel).await, 1);

        t.publish(&channel, Bytes::from("x")).await.unwrap();
        assert_eq!(hub.subscriber_count(&channel).await, 0);
        assert!(hub.channels().await.is_empty());
    }
}
