// tests/common/mod.rs
//
// Shared helpers for the adapter integration tests: an rx/tx adapter pair on
// a private hub, and listeners that push every payload into a queue.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use mom_pubsub::{
    // ---
    create_memory_transport_with_hub,
    Channel,
    Listener,
    MemoryHub,
    PubSubAdapter,
    PubSubAdapterBuilder,
    TransportConfig,
};

/// How long to wait for something that must happen.
pub const WAIT_WHEN_EXPECTING_EVENT: Duration = Duration::from_secs(3);

/// How long to watch for something that must not happen.
pub const WAIT_WHEN_NOT_EXPECTING_EVENT: Duration = Duration::from_millis(200);

/// Two adapters, each with its own transport, on one private hub.
pub async fn adapter_pair() -> (PubSubAdapter, PubSubAdapter) {
    // ---
    let hub = MemoryHub::new();
    let rx = adapter_on(&hub, "rx").await;
    let tx = adapter_on(&hub, "tx").await;
    (rx, tx)
}

pub async fn adapter_on(hub: &Arc<MemoryHub>, node_id: &str) -> PubSubAdapter {
    // ---
    let transport = create_memory_transport_with_hub(TransportConfig::memory(node_id), hub.clone())
        .await
        .expect("failed to create memory transport");

    PubSubAdapterBuilder::new(transport)
        .node_id(node_id)
        .owns_transport(true)
        .build()
}

/// A listener whose payloads land in `queue`.
pub struct QueueSubscription {
    pub channel: Channel,
    pub listener: Listener,
    pub queue: mpsc::UnboundedReceiver<Bytes>,
}

/// Subscribe a queueing listener and wait for its confirmation.
pub async fn subscribe_as_queue(
    adapter: &PubSubAdapter,
    channel: impl Into<Channel>,
) -> QueueSubscription {
    // ---
    let channel = channel.into();
    let (queue_tx, queue) = mpsc::unbounded_channel();
    let listener = Listener::new(move |payload| {
        let _ = queue_tx.send(payload.clone());
    });

    let (confirmed_tx, confirmed_rx) = oneshot::channel();
    adapter
        .subscribe(channel.clone(), &listener, move || {
            let _ = confirmed_tx.send(());
        })
        .await
        .expect("subscribe failed");

    timeout(WAIT_WHEN_EXPECTING_EVENT, confirmed_rx)
        .await
        .expect("timed out waiting for subscription confirmation")
        .expect("on_confirmed was dropped without firing");

    QueueSubscription {
        channel,
        listener,
        queue,
    }
}

impl QueueSubscription {
    /// Next payload, failing the test if none arrives in time.
    pub async fn pop(&mut self) -> Bytes {
        timeout(WAIT_WHEN_EXPECTING_EVENT, self.queue.recv())
            .await
            .expect("timed out waiting for payload")
            .expect("queue closed unexpectedly")
    }

    /// Assert nothing else arrives, then unsubscribe. The queue is handed
    /// back so callers can keep watching it.
    pub async fn finish(mut self, adapter: &PubSubAdapter) -> mpsc::UnboundedReceiver<Bytes> {
        // ---
        sleep(WAIT_WHEN_NOT_EXPECTING_EVENT).await;
        if let Ok(extra) = self.queue.try_recv() {
            panic!("unexpected payload on {}: {extra:?}", self.channel);
        }

        assert!(
            adapter.unsubscribe(self.channel.clone(), &self.listener),
            "listener was not subscribed to {}",
            self.channel
        );
        self.queue
    }
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
