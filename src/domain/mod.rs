//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod listener;
mod transport;

// --- Listener domain re-exports ---

pub use listener::{
    //
    BoxError,
    Listener,
};

// --- Transport domain re-exports ---

pub use transport::{
    //
    Channel,
    Envelope,
    SubscriberId,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
    DEFAULT_INBOX_CAPACITY,
};
