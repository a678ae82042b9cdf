// src/domain/listener.rs

//! Listener callbacks.
//!
//! A [`Listener`] is the callback a subscriber registers for a channel. It is
//! invoked once per broadcast payload received on that channel.
//!
//! Listeners are compared by **identity**, not by value: two listeners built
//! from identical closures are distinct, while clones of one listener are the
//! same listener. This is what lets a caller unsubscribe exactly the callback
//! it subscribed.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;

use crate::{PubSubError, Result};

/// Error type a fallible listener may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Callback = dyn Fn(&Bytes) -> std::result::Result<(), BoxError> + Send + Sync;

/// A registered broadcast callback.
///
/// Cheap to clone; every clone shares the same identity.
///
/// ```
/// # use mom_pubsub::Listener;
/// let a = Listener::new(|payload| println!("{payload:?}"));
/// let b = a.clone();
/// let c = Listener::new(|payload| println!("{payload:?}"));
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
#[derive(Clone)]
pub struct Listener {
    callback: Arc<Callback>,
}

impl Listener {
    /// Create a listener from an infallible callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        // ---
        Self {
            callback: Arc::new(move |payload: &Bytes| -> std::result::Result<(), BoxError> {
                f(payload);
                Ok(())
            }),
        }
    }

    /// Create a listener from a fallible callback.
    ///
    /// An `Err` returned here is contained by the dispatcher: it is logged and
    /// does not stop delivery to other listeners or of later payloads.
    pub fn try_new<F>(f: F) -> Self
    where
        F: Fn(&Bytes) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(f),
        }
    }

    /// Invoke the callback, converting both returned errors and panics into
    /// [`PubSubError::Listener`].
    pub(crate) fn invoke(&self, payload: &Bytes) -> Result<()> {
        // ---
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(payload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PubSubError::Listener(err.to_string())),
            Err(panic) => Err(PubSubError::Listener(panic_message(panic.as_ref()))),
        }
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.callback) as *const ()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("listener panicked: {msg}")
    } else {
        "listener panicked".to_string()
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        // Compare data pointers only; vtable pointers of the same closure may
        // differ between codegen units.
        self.addr() == other.addr()
    }
}

impl Eq for Listener {}

impl std::hash::Hash for Listener {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.addr()).finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn clones_share_identity() {
        let a = Listener::new(|_| {});
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn identical_closures_are_distinct() {
        let a = Listener::new(|_| {});
        let b = Listener::new(|_| {});
        assert_ne!(a, b);
    }

    #[test]
    fn invoke_passes_payload() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let listener = Listener::new(move |payload| {
            seen_clone.fetch_add(payload.len(), Ordering::SeqCst);
        });

        listener.invoke(&Bytes::from("hello")).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn invoke_reports_returned_error() {
        let listener = Listener::try_new(|_| Err("boom".into()));
        let err = listener.invoke(&Bytes::new()).unwrap_err();
        assert!(matches!(err, PubSubError::Listener(ref msg) if msg == "boom"));
    }

    #[test]
    fn invoke_contains_panic() {
        let listener = Listener::new(|_| panic!("kaboom"));
        let err = listener.invoke(&Bytes::new()).unwrap_err();
        assert!(matches!(err, PubSubError::Listener(ref msg) if msg.contains("kaboom")));
    }
}
