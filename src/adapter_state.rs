//! Adapter lifecycle state.
//!
//! Defines the states a [`PubSubAdapter`](crate::PubSubAdapter) moves
//! through. Transitions only go forward:
//!
//! ```text
//! Active --shutdown()--> ShuttingDown --drain complete--> Shutdown
//! ```

use std::fmt;

/// Lifecycle state of a pub/sub adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Accepting subscriptions and broadcasts.
    ///
    /// Allows: `subscribe()`, `unsubscribe()`, `broadcast()`, `shutdown()`
    Active,

    /// `shutdown()` has started; registrations are being dropped and
    /// transport subscriptions released.
    ///
    /// `subscribe()` and `broadcast()` fail with `Stopped`.
    ShuttingDown,

    /// Terminal. Every listener has been dropped.
    ///
    /// `subscribe()` and `broadcast()` fail with `Stopped`; `shutdown()` is a
    /// no-op.
    Shutdown,
}

impl AdapterState {
    /// Whether `subscribe` and `broadcast` are permitted.
    pub fn is_active(self) -> bool {
        matches!(self, AdapterState::Active)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Active => "active",
            AdapterState::ShuttingDown => "shutting_down",
            AdapterState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}
