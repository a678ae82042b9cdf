//! Dispatcher: transport inbox to listener fanout.
//!
//! For every channel an adapter listens to, the dispatcher runs one receive
//! loop over the transport inbox for that channel. Each envelope is fanned
//! out to the listeners registered in the adapter's [`Registry`] at the time
//! the envelope is dispatched.
//!
//! ## Ordering
//!
//! One loop per channel consumes its inbox sequentially, so payloads that a
//! sender published on one channel are handed to each listener in publish
//! order. Loops for different channels run as independent tasks; no ordering
//! holds across channels, nor between distinct listeners of one channel.
//!
//! ## Error handling
//!
//! A listener that returns an error or panics is logged at `warn` level and
//! skipped. Delivery to the remaining listeners and to later envelopes
//! continues; a listener failure never terminates the loop.
//!
//! ## Lifecycle
//!
//! The loop exits when the transport closes the inbox. The adapter aborts a
//! loop when it stops listening to the channel; because listeners run
//! synchronously between inbox reads, an abort never interrupts a dispatch
//! half-way through its snapshot.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_warn,
    Envelope,
    Registry,
    SubscriptionHandle,
};

/// Deliver one envelope to every listener currently registered on its channel.
///
/// Returns the number of listeners that completed without error.
pub(crate) fn dispatch(node_id: &str, registry: &Registry, env: &Envelope) -> usize {
    // ---
    let listeners = registry.snapshot(&env.channel);
    let mut delivered = 0;

    for listener in &listeners {
        match listener.invoke(&env.payload) {
            Ok(()) => delivered += 1,
            Err(_err) => {
                log_warn!("{node_id}: listener on {} failed: {_err}", env.channel);
            }
        }
    }

    log_debug!(
        "{node_id}: dispatched on {} to {delivered}/{} listeners",
        env.channel,
        listeners.len()
    );
    delivered
}

/// Spawn the receive loop for one transport subscription.
///
/// The returned [`JoinHandle`] is owned by the adapter, which aborts it when
/// the channel is released.
pub(crate) fn spawn_receive_loop(
    node_id: Arc<str>,
    handle: SubscriptionHandle,
    registry: Arc<Registry>,
) -> JoinHandle<()> {
    // ---
    let SubscriptionHandle {
        id,
        channel,
        mut inbox,
    } = handle;

    tokio::spawn(async move {
        log_debug!("{node_id}: receive loop started for {channel} ({id})");

        while let Some(env) = inbox.recv().await {
            dispatch(&node_id, &registry, &env);
        }

        log_debug!("{node_id}: transport closed inbox for {channel} ({id})");
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Channel, Listener, SubscriberId};
    use bytes::Bytes;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn recorder() -> (Listener, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let listener = Listener::new(move |payload| {
            seen_clone.lock().unwrap().push(payload.clone());
        });
        (listener, seen)
    }

    #[test]
    fn dispatch_reaches_only_matching_channel() {
        let registry = Registry::new();
        let (listener, seen) = recorder();
        registry.add(&Channel::from("channel"), &listener);

        let other = Envelope::new(Channel::from("other channel"), Bytes::from("one"));
        let matching = Envelope::new(Channel::from("channel"), Bytes::from("two"));

        assert_eq!(dispatch("test", &registry, &other), 0);
        assert_eq!(dispatch("test", &registry, &matching), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Bytes::from("two")]);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let registry = Registry::new();
        let channel = Channel::from("channel");
        let (good, seen) = recorder();
        let failing = Listener::try_new(|_| Err("nope".into()));
        let panicking = Listener::new(|_| panic!("listener bug"));

        registry.add(&channel, &failing);
        registry.add(&channel, &panicking);
        registry.add(&channel, &good);

        let env = Envelope::new(channel, Bytes::from("hello"));
        assert_eq!(dispatch("test", &registry, &env), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receive_loop_preserves_order_and_ends_on_close() {
        let registry = Arc::new(Registry::new());
        let channel = Channel::from("channel");
        let (listener, seen) = recorder();
        registry.add(&channel, &listener);

        let (tx, rx) = mpsc::channel(8);
        let handle = SubscriptionHandle {
            id: SubscriberId::next(),
            channel: channel.clone(),
            inbox: rx,
        };
        let join = spawn_receive_loop(Arc::from("test"), handle, registry);

        for word in ["bananas", "apples", "cherries"] {
            tx.send(Envelope::new(channel.clone(), Bytes::from(word)))
                .await
                .unwrap();
        }
        drop(tx);
        join.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Bytes::from("bananas"),
                Bytes::from("apples"),
                Bytes::from("cherries")
            ]
        );
    }
}
