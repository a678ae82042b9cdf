//! Pub/sub adapter.
//!
//! [`PubSubAdapter`] is the public face of the crate: it composes a
//! [`Registry`], the dispatcher receive loops, and a shared [`Transport`],
//! and exposes `subscribe`, `unsubscribe`, `broadcast` and `shutdown`.
//!
//! Several adapters may share one transport (for example a receive side and
//! a send side in the same process). Each keeps its own registry and its own
//! transport subscriptions, so shutting one down never disturbs the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::{
    // ---
    dispatcher,
    log_debug,
    log_info,
    log_warn,
    AdapterState,
    Channel,
    Listener,
    PubSubError,
    Registry,
    Result,
    SubscriberId,
    TransportConfig,
    TransportPtr,
};

/// A channel this adapter is listening to at the transport level.
struct ActiveChannel {
    id: SubscriberId,
    task: JoinHandle<()>,
}

impl ActiveChannel {
    /// Whether this loop can no longer receive anything.
    fn is_dead(&self, transport: &TransportPtr) -> bool {
        self.task.is_finished() || transport.is_closed()
    }
}

/// Backend-agnostic pub/sub adapter.
///
/// Cheap to clone; clones share the same registry and lifecycle.
///
/// Dropping the last clone stops the receive loops and releases the
/// transport subscriptions in the background. Call
/// [`shutdown`](PubSubAdapter::shutdown) to release them before returning,
/// and to close an owned transport.
///
/// # Example
///
/// ```no_run
/// use mom_pubsub::{Listener, PubSubAdapter, TransportBuilder};
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let transport = TransportBuilder::new().uri("memory://").node_id("chat").build().await?;
///
/// let rx = PubSubAdapter::new(transport.clone());
/// let tx = PubSubAdapter::new(transport);
///
/// let listener = Listener::new(|payload| println!("got {payload:?}"));
/// rx.subscribe("lobby", &listener, || println!("listening")).await?;
///
/// tx.broadcast("lobby", "hello world").await?;
///
/// rx.unsubscribe("lobby", &listener);
/// tx.shutdown().await?;
/// rx.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct PubSubAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    transport: TransportPtr,
    node_id: Arc<str>,
    owns_transport: bool,
    registry: Arc<Registry>,
    state: Mutex<AdapterState>,

    // Channels with a transport subscription and a receive loop. Held across
    // the transport handshake so subscribe, release and shutdown of a
    // channel never interleave.
    listening: tokio::sync::Mutex<HashMap<Channel, ActiveChannel>>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PubSubAdapter {
    /// Create an adapter over a shared transport.
    ///
    /// The adapter never closes `transport`; use
    /// [`PubSubAdapterBuilder::owns_transport`](crate::PubSubAdapterBuilder::owns_transport)
    /// or [`PubSubAdapter::connect`] for an adapter that does.
    pub fn new(transport: TransportPtr) -> Self {
        // ---
        let node_id = transport.transport_id().to_string();
        Self::with_options(transport, node_id, false)
    }

    /// Create a transport from `config` and an adapter that owns it.
    ///
    /// The transport is closed when the adapter shuts down.
    ///
    /// # Errors
    ///
    /// Returns any error raised while creating the transport.
    pub async fn connect(config: TransportConfig) -> Result<Self> {
        // ---
        let node_id = config.node_id.clone();
        let transport = crate::create_transport(config).await?;
        Ok(Self::with_options(transport, node_id, true))
    }

    /// Create a new adapter (internal use by PubSubAdapterBuilder).
    pub(crate) fn with_options(
        transport: TransportPtr,
        node_id: String,
        owns_transport: bool,
    ) -> Self {
        // ---
        log_debug!("{node_id}: create adapter (owns_transport={owns_transport})");

        Self {
            inner: Arc::new(Inner {
                transport,
                node_id: Arc::from(node_id),
                owns_transport,
                registry: Arc::new(Registry::new()),
                state: Mutex::new(AdapterState::Active),
                listening: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Logical node id used in log output.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *lock_ignore_poison(&self.inner.state)
    }

    /// The transport this adapter publishes and listens through.
    pub fn transport(&self) -> TransportPtr {
        self.inner.transport.clone()
    }

    /// Whether `listener` is currently registered on `channel`.
    pub fn is_subscribed(&self, channel: impl Into<Channel>, listener: &Listener) -> bool {
        self.inner.registry.contains(&channel.into(), listener)
    }

    /// Channels with at least one registered listener on this adapter.
    pub fn subscribed_channels(&self) -> Vec<Channel> {
        self.inner.registry.channels()
    }

    /// Subscribe `listener` to `channel`.
    ///
    /// If this adapter is not yet listening to `channel`, the transport
    /// handshake is performed first. `on_confirmed` is invoked exactly once,
    /// after the registration is effective: any broadcast issued after it
    /// fires, and before a matching `unsubscribe`, reaches `listener`.
    ///
    /// Subscribing a pair that is already registered is a no-op that still
    /// invokes `on_confirmed`; it never creates a second delivery path.
    ///
    /// The adapter imposes no timeout on the handshake. Wrap the call in
    /// `tokio::time::timeout` to bound the wait.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::Stopped`] if the adapter is not active.
    /// - [`PubSubError::Transport`] if the handshake failed; nothing is
    ///   registered and `on_confirmed` is not invoked. A channel whose
    ///   transport delivery path has died (transport closed, broker
    ///   connection lost) is handshaken again, so this is reported instead
    ///   of a confirmation that can never deliver.
    pub async fn subscribe<F>(
        &self,
        channel: impl Into<Channel>,
        listener: &Listener,
        on_confirmed: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send,
    {
        // ---
        let channel = channel.into();
        let node_id = &self.inner.node_id;

        self.ensure_active()?;

        {
            let mut listening = self.inner.listening.lock().await;

            // shutdown may have started while waiting for the lock
            self.ensure_active()?;

            // A loop whose inbox was closed by the transport delivers nothing
            // more; drop it and redo the handshake so the failure surfaces.
            let stale = listening
                .get(&channel)
                .is_some_and(|active| active.is_dead(&self.inner.transport));
            if stale {
                if let Some(active) = listening.remove(&channel) {
                    log_warn!("{node_id}: delivery path for {channel} is gone, resubscribing");
                    self.inner.discard(&channel, active).await;
                }
            }

            if !listening.contains_key(&channel) {
                let handle = self.inner.transport.subscribe(&channel).await?;
                let id = handle.id;
                let task = dispatcher::spawn_receive_loop(
                    node_id.clone(),
                    handle,
                    self.inner.registry.clone(),
                );
                listening.insert(channel.clone(), ActiveChannel { id, task });
                log_info!("{node_id}: listening on {channel} ({id})");
            }

            if !self.inner.registry.add(&channel, listener) {
                log_debug!("{node_id}: {listener:?} already subscribed to {channel}");
            }
        }

        on_confirmed();
        Ok(())
    }

    /// Subscribe `listener` to `channel`; the returned future resolving `Ok`
    /// is the confirmation.
    ///
    /// # Errors
    ///
    /// Same as [`PubSubAdapter::subscribe`].
    pub async fn subscribe_confirmed(
        &self,
        channel: impl Into<Channel>,
        listener: &Listener,
    ) -> Result<()> {
        self.subscribe(channel, listener, || {}).await
    }

    /// Remove `listener` from `channel`.
    ///
    /// The registry is updated before this returns: no dispatch that starts
    /// afterwards invokes `listener` for `channel`. A dispatch already under
    /// way may still deliver its one payload.
    ///
    /// Safe to call from inside a listener. When the last listener of a
    /// channel is removed, the transport subscription is released in the
    /// background; the release is skipped if the channel gained a listener
    /// in the meantime.
    ///
    /// Returns whether a registration was removed.
    pub fn unsubscribe(&self, channel: impl Into<Channel>, listener: &Listener) -> bool {
        // ---
        let channel = channel.into();
        let removed = self.inner.registry.remove(&channel, listener);

        if removed && self.inner.registry.is_empty(&channel) {
            self.schedule_release(channel);
        }
        removed
    }

    /// Broadcast `message` on `channel` to every adapter listening to it
    /// through this adapter's transport, including this one.
    ///
    /// Returns once the transport accepted the message. Does not wait for
    /// any listener to run.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::Stopped`] if the adapter is not active.
    /// - [`PubSubError::Transport`] if the transport rejected the message.
    pub async fn broadcast(
        &self,
        channel: impl Into<Channel>,
        message: impl Into<Bytes>,
    ) -> Result<()> {
        // ---
        let channel = channel.into();
        self.ensure_active()?;

        log_debug!("{}: broadcast on {channel}", self.inner.node_id);
        self.inner.transport.publish(&channel, message.into()).await
    }

    /// Take the adapter out of service.
    ///
    /// Drops every registration, stops every receive loop, releases this
    /// adapter's transport subscriptions and, if the adapter owns its
    /// transport, closes it. Other adapters sharing the transport are not
    /// affected.
    ///
    /// Idempotent: calls after the first return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the first transport error met while releasing subscriptions
    /// or closing the transport. The adapter still ends in
    /// [`AdapterState::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        let node_id = &self.inner.node_id;

        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if !state.is_active() {
                return Ok(());
            }
            *state = AdapterState::ShuttingDown;
        }

        log_debug!("{node_id}: shutting down");

        let drained: Vec<(Channel, ActiveChannel)> = {
            let mut listening = self.inner.listening.lock().await;
            self.inner.registry.clear();
            listening.drain().collect()
        };

        let mut first_err: Option<PubSubError> = None;

        for (channel, active) in drained {
            active.task.abort();
            if let Err(err) = self.inner.transport.unsubscribe(&channel, active.id).await {
                log_warn!("{node_id}: failed to release {channel}: {err}");
                first_err.get_or_insert(err);
            }
        }

        if self.inner.owns_transport {
            if let Err(err) = self.inner.transport.close().await {
                log_warn!("{node_id}: failed to close transport: {err}");
                first_err.get_or_insert(err);
            }
        }

        *lock_ignore_poison(&self.inner.state) = AdapterState::Shutdown;
        log_info!("{node_id}: shut down");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state().is_active() {
            Ok(())
        } else {
            Err(PubSubError::Stopped)
        }
    }

    fn schedule_release(&self, channel: Channel) {
        // ---
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    inner.release_channel(&channel).await;
                });
            }
            Err(_) => {
                log_debug!(
                    "{}: no runtime, {channel} stays listened until shutdown",
                    self.inner.node_id
                );
            }
        }
    }
}

impl Inner {
    /// Stop a dead loop and drop whatever is left of its transport
    /// subscription. Errors are expected here and only logged.
    async fn discard(&self, channel: &Channel, active: ActiveChannel) {
        // ---
        active.task.abort();
        if let Err(_err) = self.transport.unsubscribe(channel, active.id).await {
            log_debug!("{}: stale {channel} ({}): {_err}", self.node_id, active.id);
        }
    }

    /// Stop listening to `channel` if it still has no listener.
    async fn release_channel(&self, channel: &Channel) {
        // ---
        let mut listening = self.listening.lock().await;

        if !self.registry.is_empty(channel) {
            return;
        }
        let Some(active) = listening.remove(channel) else {
            return;
        };

        active.task.abort();
        log_debug!("{}: released {channel} ({})", self.node_id, active.id);

        if let Err(_err) = self.transport.unsubscribe(channel, active.id).await {
            log_warn!("{}: failed to release {channel}: {_err}", self.node_id);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        // Receive loops hold only the registry; stop them with the adapter.
        let released: Vec<(Channel, SubscriberId)> = self
            .listening
            .get_mut()
            .drain()
            .map(|(channel, active)| {
                active.task.abort();
                (channel, active.id)
            })
            .collect();

        if released.is_empty() {
            return;
        }

        // Without a runtime the transport keeps the subscriptions until it is
        // closed; `shutdown` is the way to release them deterministically.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log_debug!("{}: dropped without runtime, subscriptions kept", self.node_id);
            return;
        };

        let transport = self.transport.clone();
        let node_id = self.node_id.clone();
        runtime.spawn(async move {
            for (channel, id) in released {
                if let Err(_err) = transport.unsubscribe(&channel, id).await {
                    log_debug!("{node_id}: release of {channel} on drop failed: {_err}");
                }
            }
        });
    }
}

impl Clone for PubSubAdapter {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for PubSubAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubAdapter")
            .field("node_id", &self.inner.node_id)
            .field("state", &self.state())
            .field("owns_transport", &self.inner.owns_transport)
            .finish()
    }
}
