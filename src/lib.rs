//! Backend-agnostic pub/sub broadcast adapter.
//!
//! Many independent parts of a process subscribe listeners to named
//! channels and receive every message broadcast on those channels, by any
//! sender, while the transport that carries the messages is pluggable:
//!
//! - an in-process hub ([`create_memory_transport`]), and
//! - Redis Pub/Sub (`transport_redis` feature, [`create_redis_transport`]).
//!
//! [`PubSubAdapter`] handles registration and confirmation, fanout to exactly
//! the listeners subscribed at dispatch time, and race-free unsubscription.
//! Several adapters can share one transport while keeping independent
//! subscription bookkeeping.
//!
//! ```no_run
//! use mom_pubsub::{Listener, PubSubAdapter, TransportBuilder};
//!
//! # async fn example() -> mom_pubsub::Result<()> {
//! let transport = TransportBuilder::new().uri("memory://").build().await?;
//! let adapter = PubSubAdapter::new(transport);
//!
//! let listener = Listener::new(|payload| println!("{payload:?}"));
//! adapter.subscribe_confirmed("news", &listener).await?;
//! adapter.broadcast("news", "hello world").await?;
//! adapter.unsubscribe("news", &listener);
//! adapter.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod macros;

mod adapter;
mod adapter_builder;
mod adapter_state;
mod dispatcher;
mod domain;
mod registry;
mod transport;
mod transport_builder;

mod error;

#[cfg_attr(not(feature = "transport_redis"), allow(unused_imports))]
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use adapter::PubSubAdapter;
pub use adapter_builder::PubSubAdapterBuilder;
pub use adapter_state::AdapterState;
pub use registry::Registry;
pub use transport_builder::TransportBuilder;

pub use error::{PubSubError, Result};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    create_redis_transport,
    create_transport,
    MemoryHub,
};

// --- public re-exports
pub use domain::{
    //
    BoxError,
    Channel,
    Envelope,
    Listener,
    SubscriberId,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
    DEFAULT_INBOX_CAPACITY,
};
