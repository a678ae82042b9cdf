//! Subscription registry.
//!
//! Per-adapter mapping from channel to the listeners registered on it. Each
//! adapter owns its own registry; two adapters sharing a transport never see
//! each other's listeners.
//!
//! The registry lock is held only while the map is read or modified, never
//! while a listener runs. Dispatch copies the listener list under the lock
//! ([`Registry::snapshot`]) and invokes the copy afterwards, so a listener may
//! call `subscribe`/`unsubscribe` on its own adapter without deadlocking.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Channel, Listener};

/// Thread-safe channel -> listeners map.
#[derive(Default)]
pub struct Registry {
    subscriptions: RwLock<HashMap<Channel, Vec<Listener>>>,
}

/// Acquire read guard, ignoring poisoning
fn read_ignore_poison<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Acquire write guard, ignoring poisoning
fn write_ignore_poison<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` on `channel`.
    ///
    /// Returns `false` if the pair was already registered; the registry is
    /// left unchanged in that case, so a pair is never delivered to twice.
    pub fn add(&self, channel: &Channel, listener: &Listener) -> bool {
        // ---
        let mut subs = write_ignore_poison(&self.subscriptions);
        let listeners = subs.entry(channel.clone()).or_default();

        if listeners.contains(listener) {
            return false;
        }
        listeners.push(listener.clone());
        true
    }

    /// Deregister `listener` from `channel`.
    ///
    /// Returns whether a registration was actually removed. Removing an absent
    /// pair is a no-op. The channel entry is pruned once it has no listeners.
    pub fn remove(&self, channel: &Channel, listener: &Listener) -> bool {
        // ---
        let mut subs = write_ignore_poison(&self.subscriptions);

        let Some(listeners) = subs.get_mut(channel) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|l| l != listener);
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            subs.remove(channel);
        }
        removed
    }

    /// Listeners registered on `channel` at the instant of the call.
    ///
    /// Every add/remove that completed before this call is reflected; the
    /// returned list is independent of later changes.
    pub fn snapshot(&self, channel: &Channel) -> Vec<Listener> {
        read_ignore_poison(&self.subscriptions)
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `listener` is currently registered on `channel`.
    pub fn contains(&self, channel: &Channel, listener: &Listener) -> bool {
        read_ignore_poison(&self.subscriptions)
            .get(channel)
            .is_some_and(|listeners| listeners.contains(listener))
    }

    /// Whether no listener is registered on `channel`.
    pub fn is_empty(&self, channel: &Channel) -> bool {
        !read_ignore_poison(&self.subscriptions).contains_key(channel)
    }

    /// Channels with at least one listener, in no particular order.
    pub fn channels(&self) -> Vec<Channel> {
        read_ignore_poison(&self.subscriptions)
            .keys()
            .cloned()
            .collect()
    }

    /// Total number of (channel, listener) registrations.
    pub fn len(&self) -> usize {
        read_ignore_poison(&self.subscriptions)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        write_ignore_poison(&self.subscriptions).clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Arc;

    fn noop() -> Listener {
        Listener::new(|_| {})
    }

    #[test]
    fn add_reports_new_registrations_only() {
        let registry = Registry::new();
        let channel = Channel::from("channel");
        let listener = noop();

        assert!(registry.add(&channel, &listener));
        assert!(!registry.add(&channel, &listener));
        assert_eq!(registry.snapshot(&channel).len(), 1);
    }

    #[test]
    fn same_listener_on_many_channels() {
        let registry = Registry::new();
        let listener = noop();

        assert!(registry.add(&Channel::from("a"), &listener));
        assert!(registry.add(&Channel::from("b"), &listener));
        assert_eq!(registry.len(), 2);

        let mut channels = registry.channels();
        channels.sort();
        assert_eq!(channels, vec![Channel::from("a"), Channel::from("b")]);
    }

    #[test]
    fn remove_is_idempotent_and_prunes() {
        let registry = Registry::new();
        let channel = Channel::from("channel");
        let listener = noop();

        registry.add(&channel, &listener);
        assert!(registry.remove(&channel, &listener));
        assert!(!registry.remove(&channel, &listener));
        assert!(registry.is_empty(&channel));
        assert!(registry.channels().is_empty());
    }

    #[test]
    fn remove_only_touches_the_given_listener() {
        let registry = Registry::new();
        let channel = Channel::from("channel");
        let first = noop();
        let second = noop();

        registry.add(&channel, &first);
        registry.add(&channel, &second);
        registry.remove(&channel, &first);

        assert!(!registry.contains(&channel, &first));
        assert!(registry.contains(&channel, &second));
        assert!(!registry.is_empty(&channel));
    }

    #[test]
    fn snapshot_is_detached_from_later_changes() {
        let registry = Registry::new();
        let channel = Channel::from("channel");
        let listener = noop();

        registry.add(&channel, &listener);
        let snapshot = registry.snapshot(&channel);
        registry.remove(&channel, &listener);

        assert_eq!(snapshot, vec![listener]);
        assert!(registry.snapshot(&channel).is_empty());
    }

    #[test]
    fn concurrent_adds_and_removes() {
        let registry = Arc::new(Registry::new());
        let channel = Channel::from("channel");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let channel = channel.clone();
                std::thread::spawn(move || {
                    let kept = noop();
                    let dropped = noop();
                    for _ in 0..100 {
                        registry.add(&channel, &dropped);
                        registry.remove(&channel, &dropped);
                    }
                    registry.add(&channel, &kept);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot(&channel).len(), 8);
    }

    #[test]
    fn clear_drops_everything() {
        let registry = Registry::new();
        registry.add(&Channel::from("a"), &noop());
        registry.add(&Channel::from("b"), &noop());

        registry.clear();
        assert_eq!(registry.len(), 0);
    }
}
