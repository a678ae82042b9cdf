//! Pub/sub adapter builder.
//!
//! Provides a fluent builder API for configuring [`PubSubAdapter`] instances
//! over an existing transport.

use crate::{PubSubAdapter, TransportPtr};

/// Builder for creating pub/sub adapters.
///
/// # Examples
///
/// ## Receive and send sides sharing one transport
/// ```no_run
/// use mom_pubsub::{PubSubAdapterBuilder, TransportBuilder};
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let transport = TransportBuilder::new()
///     .uri("redis://localhost:6379")
///     .node_id("web-1")
///     .build()
///     .await?;
///
/// let rx = PubSubAdapterBuilder::new(transport.clone()).node_id("web-1/rx").build();
/// let tx = PubSubAdapterBuilder::new(transport).node_id("web-1/tx").build();
/// # Ok(())
/// # }
/// ```
///
/// ## Adapter that closes its transport on shutdown
/// ```no_run
/// use mom_pubsub::{PubSubAdapterBuilder, TransportBuilder};
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let transport = TransportBuilder::new().uri("memory://").node_id("worker").build().await?;
///
/// let adapter = PubSubAdapterBuilder::new(transport).owns_transport(true).build();
/// adapter.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct PubSubAdapterBuilder {
    // ---
    transport: TransportPtr,
    node_id: Option<String>,
    owns_transport: bool,
}

impl PubSubAdapterBuilder {
    /// Create a new adapter builder over `transport`.
    ///
    /// The adapter's `node_id` defaults to `transport.transport_id()`.
    pub fn new(transport: TransportPtr) -> Self {
        // ---
        Self {
            transport,
            node_id: None,
            owns_transport: false,
        }
    }

    /// Override the adapter's logical node ID.
    ///
    /// Useful to tell apart several adapters sharing one transport in logs.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    /// Whether the adapter closes the transport on shutdown.
    ///
    /// Default: `false`. Only set this when no other adapter uses the
    /// transport.
    pub fn owns_transport(mut self, owns: bool) -> Self {
        self.owns_transport = owns;
        self
    }

    /// Build the adapter (consumes self).
    pub fn build(self) -> PubSubAdapter {
        // ---
        let node_id = self
            .node_id
            .unwrap_or_else(|| self.transport.transport_id().to_string());

        PubSubAdapter::with_options(self.transport, node_id, self.owns_transport)
    }
}
