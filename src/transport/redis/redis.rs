//! Redis Pub/Sub transport implementation using `redis`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! Redis Pub/Sub.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the Pub/Sub connection.
//! - The actor is responsible for:
//!   - issuing `SUBSCRIBE`/`UNSUBSCRIBE` via `pubsub_sink`,
//!   - polling `pubsub_stream` for incoming messages and fanning them out,
//!   - clean shutdown of the connection.
//! - Publishing does **not** go through the actor. Each publish clones the
//!   `MultiplexedConnection` and issues `PUBLISH` directly, so broadcasts on
//!   unrelated channels are never queued behind subscription management or
//!   behind each other.
//!
//! ## Two connections required
//!
//! Redis mandates a dedicated connection for Pub/Sub; a connection in
//! Pub/Sub mode cannot issue regular commands like `PUBLISH`. Two async
//! connections are therefore maintained:
//!
//! - `publish_conn`: `MultiplexedConnection`, used only for `PUBLISH`
//! - `pubsub_sink` / `pubsub_stream`: split from `aio::PubSub`, used for
//!   `SUBSCRIBE` and receiving incoming messages respectively
//!
//! ## Subscription confirmation
//!
//! `PubSubSink::subscribe()` resolves only after the broker confirms the
//! subscription. The local inbox is registered *before* the command is sent,
//! so every message the broker forwards after confirming is routed.
//!
//! Each distinct Redis channel is subscribed once per transport, however many
//! local inboxes share it. The last local unsubscribe issues `UNSUBSCRIBE`;
//! the actor re-checks for local inboxes first, so a concurrent subscribe is
//! never starved.
//!
//! ## Message delivery semantics
//!
//! - Payloads are published raw; no envelope is added on the wire, so other
//!   Redis clients can publish to and read from the same channels.
//! - The optional channel prefix is prepended on the wire and stripped on
//!   receipt.
//! - Fanout delivers each message to *all* local inboxes of the channel, in
//!   the order the broker delivered them. A full inbox makes the actor wait.
//! - Delivery is best-effort and non-durable; there is no replay.
//! - If the Pub/Sub connection is lost, every inbox is closed and further
//!   subscribes fail. Reconnection is left to the caller.

use futures_util::StreamExt;

use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
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

/// Local inboxes keyed by Redis channel name (prefix included).
type SubscriberMap = Arc<RwLock<HashMap<String, Vec<LocalSubscriber>>>>;

struct LocalSubscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Envelope>,
}

//
// Actor commands
//

enum Cmd {
    //
    Subscribe {
        topic: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        topic: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

impl Cmd {
    // ---

    /// Dispatches an actor command to the correct handler on the actor.
    async fn handle(self, actor: &mut RedisActor) -> ActorStep {
        // ---

        match self {
            Cmd::Subscribe { topic, resp } => {
                let result = actor.handle_subscribe(topic).await;
                let _ = resp.send(result);
                ActorStep::Continue
            }
            Cmd::Unsubscribe { topic, resp } => {
                let result = actor.handle_unsubscribe(topic).await;
                let _ = resp.send(result);
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                actor.handle_close().await;
                let _ = resp.send(Ok(()));
                ActorStep::Stop
            }
        }
    }
}

/// Redis Pub/Sub implementation of the `Transport` trait.
pub struct RedisTransport {
    // ---
    base: TransportBase,
    prefix: String,
    publish_conn: MultiplexedConnection,
    cmd_tx: mpsc::Sender<Cmd>,
    subscribers: SubscriberMap,
    task: Mutex<Option<JoinHandle<()>>>,
    // Shared with the actor, which sets it when the Pub/Sub stream ends.
    closed: Arc<AtomicBool>,
}

impl RedisTransport {
    // ---

    /// Creates a new Redis transport from the given connections.
    ///
    /// Infallible: the broker connections have already been established in
    /// `create_transport` before this is called.
    pub fn create(
        base: TransportBase,
        prefix: String,
        publish_conn: MultiplexedConnection,
        pubsub_sink: PubSubSink,
        pubsub_stream: PubSubStream,
    ) -> TransportPtr {
        // ---

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let actor = RedisActor {
            transport_id: base.transport_id.clone(),
            prefix: prefix.clone(),
            pubsub_sink,
            pubsub_stream,
            cmd_rx,
            subscribers: Arc::clone(&subscribers),
            broker_topics: HashSet::new(),
            closed: Arc::clone(&closed),
        };

        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            base,
            prefix,
            publish_conn,
            cmd_tx,
            subscribers,
            task: Mutex::new(Some(handle)),
            closed,
        })
    }

    fn topic(&self, channel: &Channel) -> String {
        format!("{}{}", self.prefix, channel)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Transport(format!(
                "{}: redis transport is closed",
                self.base.transport_id
            )));
        }
        Ok(())
    }

    /// Send a command to the actor and wait for its answer.
    async fn request(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Cmd) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx.send(make(tx)).await.map_err(|e| {
            let msg = format!("actor command channel closed:{e}");
            PubSubError::Transport(msg)
        })?;

        rx.await.map_err(|e| {
            let msg = format!("actor responder channel read failed:{e}");
            PubSubError::Transport(msg)
        })?
    }

    async fn remove_local(&self, topic: &str, id: SubscriberId) -> bool {
        // ---
        let mut map = self.subscribers.write().await;
        let Some(locals) = map.get_mut(topic) else {
            return false;
        };
        locals.retain(|s| s.id != id);
        let now_empty = locals.is_empty();
        if now_empty {
            map.remove(topic);
        }
        now_empty
    }
}

struct RedisActor {
    // ---
    transport_id: String, // for logging only
    prefix: String,
    pubsub_sink: PubSubSink,
    pubsub_stream: PubSubStream,
    cmd_rx: mpsc::Receiver<Cmd>,
    subscribers: SubscriberMap,
    // Topics the broker has confirmed for this connection.
    broker_topics: HashSet<String>,
    closed: Arc<AtomicBool>,
}

impl RedisActor {
    // ---

    async fn run(mut self) {
        // ---

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(cmd.handle(&mut self).await, ActorStep::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                maybe_msg = self.pubsub_stream.next() => {
                    match maybe_msg {
                        Some(msg) => self.handle_incoming(msg).await,
                        None => {
                            log_error!(
                                "{}: pubsub stream ended, closing all inboxes",
                                self.transport_id
                            );
                            self.closed.store(true, Ordering::Release);
                            self.subscribers.write().await.clear();
                            break;
                        }
                    }
                }
            }
        }

        log_debug!("{}: redis actor stopped", self.transport_id);
    }

    /// Subscribes the connection to `topic` unless it already is.
    ///
    /// Resolves after the broker confirmed the subscription.
    async fn handle_subscribe(&mut self, topic: String) -> Result<()> {
        // ---

        let transport_id = self.transport_id.as_str();

        if self.broker_topics.contains(&topic) {
            log_debug!("{transport_id}: already subscribed to topic {topic}");
            return Ok(());
        }

        match self.pubsub_sink.subscribe(&topic).await {
            Ok(()) => {
                log_info!("{transport_id}: successfully subscribed to topic {topic}");
                self.broker_topics.insert(topic);
                Ok(())
            }
            Err(err) => {
                let msg = format!("{transport_id}: failed to subscribe to topic {topic}: {err}");
                log_error!("{msg}");
                Err(PubSubError::Transport(msg))
            }
        }
    }

    /// Unsubscribes the connection from `topic` if no local inbox wants it.
    async fn handle_unsubscribe(&mut self, topic: String) -> Result<()> {
        // ---

        let transport_id = self.transport_id.as_str();

        if self.subscribers.read().await.contains_key(&topic) {
            log_debug!("{transport_id}: topic {topic} has new local subscribers, keeping it");
            return Ok(());
        }
        if !self.broker_topics.remove(&topic) {
            return Ok(());
        }

        self.pubsub_sink.unsubscribe(&topic).await.map_err(|err| {
            let msg = format!("{transport_id}: failed to unsubscribe from topic {topic}: {err}");
            log_error!("{msg}");
            PubSubError::Transport(msg)
        })?;

        log_debug!("{transport_id}: unsubscribed from topic {topic}");
        Ok(())
    }

    /// Disconnects from the Redis broker.
    async fn handle_close(&mut self) {
        // ---

        log_debug!("{}: disconnecting redis client", self.transport_id);

        for topic in self.broker_topics.drain() {
            let _ = self.pubsub_sink.unsubscribe(&topic).await;
        }
        self.subscribers.write().await.clear();
    }

    /// Fans one incoming message out to the local inboxes of its channel.
    ///
    /// Inboxes whose receiver has gone away are evicted.
    async fn handle_incoming(&mut self, msg: redis::Msg) {
        // ---

        let topic = msg.get_channel_name().to_string();

        let payload: Vec<u8> = match msg.get_payload() {
            Ok(p) => p,
            Err(_err) => {
                log_debug!(
                    "{}: failed to get payload on topic {topic}: {_err}",
                    self.transport_id
                );
                return;
            }
        };

        let senders: Vec<mpsc::Sender<Envelope>> = {
            let map = self.subscribers.read().await;
            match map.get(&topic) {
                Some(locals) => locals.iter().map(|s| s.sender.clone()).collect(),
                None => return,
            }
        };

        let channel = Channel::from(topic.strip_prefix(&self.prefix).unwrap_or(&topic));
        let env = Envelope::new(channel, Bytes::from(payload));

        let mut saw_closed = false;
        for tx in senders {
            if tx.send(env.clone()).await.is_err() {
                saw_closed = true;
            }
        }

        if saw_closed {
            let now_empty = {
                let mut map = self.subscribers.write().await;
                match map.get_mut(&topic) {
                    Some(locals) => {
                        locals.retain(|s| !s.sender.is_closed());
                        let empty = locals.is_empty();
                        if empty {
                            map.remove(&topic);
                        }
                        empty
                    }
                    None => false,
                }
            };

            // Nobody will unsubscribe an evicted inbox; drop the topic here.
            if now_empty {
                if let Err(_err) = self.handle_unsubscribe(topic).await {
                    log_debug!("{}: evicted topic kept: {_err}", self.transport_id);
                }
            }
        }
    }
} // RedisActor

#[async_trait::async_trait]
impl Transport for RedisTransport {
    // ---

    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, channel: &Channel, payload: Bytes) -> Result<()> {
        // ---

        self.ensure_open()?;

        let topic = self.topic(channel);
        let mut conn = self.publish_conn.clone();

        redis::cmd("PUBLISH")
            .arg(&topic)
            .arg(payload.as_ref())
            .query_async::<i64>(&mut conn)
            .await
            .map(|_receivers| {
                log_debug!(
                    "{}: published to {topic} ({_receivers} receivers)",
                    self.base.transport_id
                );
            })
            .map_err(|err| {
                let msg = format!(
                    "{}: publish failed for topic {topic}: {err}",
                    self.base.transport_id
                );
                log_error!("{msg}");
                PubSubError::Transport(msg)
            })
    }

    async fn subscribe(&self, channel: &Channel) -> Result<SubscriptionHandle> {
        // ---

        self.ensure_open()?;

        let topic = self.topic(channel);
        let id = SubscriberId::next();

        let (tx, rx) = mpsc::channel(self.base.inbox_capacity);
        {
            let mut map = self.subscribers.write().await;
            map.entry(topic.clone())
                .or_default()
                .push(LocalSubscriber { id, sender: tx });
        }

        let subscribe_topic = topic.clone();
        if let Err(err) = self
            .request(|resp| Cmd::Subscribe {
                topic: subscribe_topic,
                resp,
            })
            .await
        {
            self.remove_local(&topic, id).await;
            return Err(err);
        }

        Ok(SubscriptionHandle {
            id,
            channel: channel.clone(),
            inbox: rx,
        })
    }

    async fn unsubscribe(&self, channel: &Channel, id: SubscriberId) -> Result<()> {
        // ---

        let topic = self.topic(channel);

        if !self.remove_local(&topic, id).await || self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.request(|resp| Cmd::Unsubscribe { topic, resp }).await
    }

    async fn close(&self) -> Result<()> {
        // ---

        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // The actor may already be gone after a lost connection.
        let _ = self.request(|resp| Cmd::Close { resp }).await;

        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Creates a Redis Pub/Sub transport from the given configuration.
///
/// # Errors
///
/// Returns an error if:
/// - The broker URI is missing or cannot be parsed
/// - Connection to the Redis broker fails (both connections are eager)
pub async fn create_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---

    let uri = if config.uri.is_empty() {
        return Err(PubSubError::MissingConfig(
            "Redis transport requires URI".to_string(),
        ));
    } else {
        &config.uri
    };

    let client = redis::Client::open(uri.as_str()).map_err(|err| {
        let msg = format!("redis: failed to open client for URI {uri}: {err}");
        log_error!("{msg}");
        PubSubError::Transport(msg)
    })?;

    let publish_conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|err| {
            let msg = format!("redis: failed to connect publish connection to {uri}: {err}");
            log_error!("{msg}");
            PubSubError::Transport(msg)
        })?;

    let (pubsub_sink, pubsub_stream) = client
        .get_async_pubsub()
        .await
        .map_err(|err| {
            let msg = format!("redis: failed to connect pubsub connection to {uri}: {err}");
            log_error!("{msg}");
            PubSubError::Transport(msg)
        })?
        .split();

    log_info!("{}: connected to Redis broker at {uri}", config.node_id);

    Ok(RedisTransport::create(
        TransportBase::from(&config),
        config.channel_prefix.clone().unwrap_or_default(),
        publish_conn,
        pubsub_sink,
        pubsub_stream,
    ))
}
