//! WebSocket client for a bus server.
//!
//! One background task owns the socket: it reads frames, routes envelopes to
//! the handler table and drains the outbound queue. Outbound calls never
//! block; envelopes queued while disconnected are flushed after reconnect.

use crate::error::ClientError;
use crate::options::ClientOptions;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use shared_bus::PendingReplies;
use shared_types::{Action, BusError, Envelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Handler invoked for envelopes published on a subscribed topic.
pub type TopicHandler = Arc<dyn Fn(Envelope, &ClientSubscription) + Send + Sync>;

/// How long the server gets to answer the identity `ping`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct HandlerEntry {
    name: Option<String>,
    handler: TopicHandler,
}

struct ClientInner {
    id: String,
    url: Url,
    options: ClientOptions,
    outbound: mpsc::UnboundedSender<Envelope>,
    handlers: DashMap<String, HandlerEntry>,
    pending: Arc<PendingReplies>,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// A client-side subscription, handed to topic handlers.
#[derive(Clone)]
pub struct ClientSubscription {
    client: Client,
    topic: String,
    name: Option<String>,
}

impl ClientSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn unsubscribe(&self) -> Result<(), ClientError> {
        self.client.unsubscribe(&self.topic)
    }
}

/// WebSocket bus client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url.as_str())
            .finish()
    }
}

impl Client {
    /// Dial the server, announce the identity and start the connection task.
    ///
    /// Returns once the server acknowledged the `ping`. With `autorestart`,
    /// transport failures are retried every `restart_every` instead of
    /// returned.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let url = options.url()?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let client = Self {
            inner: Arc::new(ClientInner {
                id: options.id.clone(),
                url,
                pending: Arc::new(PendingReplies::new(options.reply_timeout)),
                options,
                outbound: outbound_tx,
                handlers: DashMap::new(),
                shutdown: shutdown_tx,
                done: done_rx,
            }),
        };

        let conn = loop {
            match client.open().await {
                Ok(conn) => break conn,
                Err(e) if client.inner.options.autorestart && e.is_transport() => {
                    warn!(
                        url = %client.inner.url,
                        error = %e,
                        retry_in_secs = client.inner.options.restart_every.as_secs_f64(),
                        "Connection failed, will retry"
                    );
                    tokio::time::sleep(client.inner.options.restart_every).await;
                }
                Err(e) => return Err(e),
            }
        };

        tokio::spawn(
            client
                .clone()
                .connection_loop(conn, outbound_rx, shutdown_rx, done_tx),
        );
        Ok(client)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Register `handler` for `topic` and subscribe on the server.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<ClientSubscription, ClientError>
    where
        F: Fn(Envelope, &ClientSubscription) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, None, Arc::new(handler))
    }

    /// Like [`Client::subscribe`], registering a subscriber name on the server.
    pub fn subscribe_named<F>(
        &self,
        topic: &str,
        name: &str,
        handler: F,
    ) -> Result<ClientSubscription, ClientError>
    where
        F: Fn(Envelope, &ClientSubscription) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, Some(name.to_string()), Arc::new(handler))
    }

    fn subscribe_inner(
        &self,
        topic: &str,
        name: Option<String>,
        handler: TopicHandler,
    ) -> Result<ClientSubscription, ClientError> {
        self.inner.handlers.insert(
            topic.to_string(),
            HandlerEntry {
                name: name.clone(),
                handler,
            },
        );
        self.send(self.sub_envelope(topic, name.as_deref()))?;
        debug!(id = %self.inner.id, topic, "Subscribed");
        Ok(ClientSubscription {
            client: self.clone(),
            topic: topic.to_string(),
            name,
        })
    }

    /// Drop the handler for `topic` and unsubscribe on the server.
    pub fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.inner.handlers.remove(topic);
        self.send(
            Envelope::action(Action::Unsubscribe)
                .with_topic(topic)
                .with_from(self.id()),
        )?;
        // The server releases the identity together with the last topic.
        if self.inner.handlers.is_empty() {
            self.send(self.ping_envelope())?;
        }
        Ok(())
    }

    /// Publish `data` on `topic`. Strings are wrapped as `{"data": ...}` by the server.
    pub fn publish(&self, topic: &str, data: Value) -> Result<(), ClientError> {
        self.send(
            Envelope::action(Action::Publish)
                .with_topic(topic)
                .with_data(data)
                .with_from(self.id()),
        )
    }

    /// Deliver `data` to the client or server registered as `id`.
    pub fn publish_to_id(&self, id: &str, data: Value) -> Result<(), ClientError> {
        self.send(
            Envelope::action(Action::PublishToId)
                .with_id(id)
                .with_data(data)
                .with_from(self.id()),
        )
    }

    /// Relay `data` to the server at `addr` through the connected server.
    pub fn publish_to_server(&self, addr: &str, data: Value, secure: bool) -> Result<(), ClientError> {
        self.send(
            Envelope::action(Action::PublishToServer)
                .with_addr(addr)
                .with_data(data)
                .with_secure(secure)
                .with_from(self.id()),
        )
    }

    /// Deliver `data` to subscribers registered under `name`, optionally
    /// scoped to `topic`.
    pub fn send_to(&self, name: &str, topic: Option<&str>, data: Value) -> Result<(), ClientError> {
        let mut env = Envelope::action(Action::SendTo)
            .with_data(data)
            .with_from(self.id());
        env.name = Some(name.to_string());
        env.topic = topic.map(str::to_string);
        self.send(env)
    }

    /// Delete `topic` on the server, for every subscriber.
    pub fn remove_topic(&self, topic: &str) -> Result<(), ClientError> {
        self.inner.handlers.remove(topic);
        self.send(
            Envelope::action(Action::RemoveTopic)
                .with_topic(topic)
                .with_from(self.id()),
        )
    }

    /// Publish on `topic` and wait for the first acknowledgement.
    pub async fn publish_wait(&self, topic: &str, data: Value) -> Result<Envelope, ClientError> {
        self.wait_reply(topic, data, |client, env| client.publish(topic, env))
            .await
            .1
    }

    /// Send to `id` and wait for its acknowledgement.
    pub async fn publish_to_id_wait(&self, id: &str, data: Value) -> Result<Envelope, ClientError> {
        self.wait_reply(id, data, |client, env| client.publish_to_id(id, env))
            .await
            .1
    }

    /// Callback form of [`Client::publish_wait`]: exactly one of `on_recv`
    /// and `on_expire(event_id, topic)` is called.
    pub async fn publish_wait_recv<R, E>(
        &self,
        topic: &str,
        data: Value,
        on_recv: R,
        on_expire: E,
    ) -> Result<(), ClientError>
    where
        R: FnOnce(Envelope),
        E: FnOnce(&str, &str),
    {
        let (event_id, outcome) = self
            .wait_reply(topic, data, |client, env| client.publish(topic, env))
            .await;
        settle(outcome, &event_id, topic, on_recv, on_expire)
    }

    /// Callback form of [`Client::publish_to_id_wait`].
    pub async fn publish_to_id_wait_recv<R, E>(
        &self,
        id: &str,
        data: Value,
        on_recv: R,
        on_expire: E,
    ) -> Result<(), ClientError>
    where
        R: FnOnce(Envelope),
        E: FnOnce(&str, &str),
    {
        let (event_id, outcome) = self
            .wait_reply(id, data, |client, env| client.publish_to_id(id, env))
            .await;
        settle(outcome, &event_id, id, on_recv, on_expire)
    }

    /// Stop the connection task. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Resolves once the connection task has ended for good.
    pub async fn done(&self) {
        let mut done = self.inner.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    async fn wait_reply<S>(
        &self,
        label: &str,
        data: Value,
        send: S,
    ) -> (String, Result<Envelope, ClientError>)
    where
        S: FnOnce(&Self, Value) -> Result<(), ClientError>,
    {
        let (correlation_id, rx) = self.inner.pending.register(label);
        let event_id = correlation_id.topic();

        let mut payload = match Envelope::from_payload(data) {
            Ok(env) => env,
            Err(e) => return (event_id, Err(e.into())),
        };
        payload.event_id = Some(event_id.clone());
        payload.from = Some(self.id().to_string());

        let pending = self.inner.pending.clone();
        let outcome = match self.subscribe(&event_id, move |reply, _| {
            pending.complete(correlation_id, reply);
        }) {
            Ok(_) => match send(self, payload.to_value()) {
                Ok(()) => self
                    .inner
                    .pending
                    .wait(correlation_id, rx, None)
                    .await
                    .map_err(ClientError::from),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        self.inner.pending.cancel(&correlation_id);
        if let Err(e) = self.remove_topic(&event_id) {
            warn!(%event_id, error = %e, "Could not remove correlation topic");
        }
        (event_id, outcome)
    }

    /// Queue a raw envelope for the server.
    pub fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| ClientError::Closed)
    }

    fn ping_envelope(&self) -> Envelope {
        Envelope::action(Action::Ping).with_from(self.id())
    }

    fn sub_envelope(&self, topic: &str, name: Option<&str>) -> Envelope {
        let mut env = Envelope::action(Action::Subscribe)
            .with_topic(topic)
            .with_from(self.id());
        env.name = name.map(str::to_string);
        env
    }

    /// Dial, ping, wait for pong and replay the handler table.
    async fn open(&self) -> Result<(WsSink, WsSource), ClientError> {
        info!(url = %self.inner.url, id = %self.inner.id, "Connecting to bus server");
        let (stream, _) = connect_async(self.inner.url.as_str())
            .await
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        sink.send(text_frame(&self.ping_envelope())?).await?;
        self.await_pong(&mut source).await?;

        let resubscribe: Vec<Envelope> = self
            .inner
            .handlers
            .iter()
            .map(|entry| self.sub_envelope(entry.key(), entry.value().name.as_deref()))
            .collect();
        for env in &resubscribe {
            sink.send(text_frame(env)?).await?;
        }

        info!(id = %self.inner.id, topics = resubscribe.len(), "Connected to bus server");
        Ok((sink, source))
    }

    async fn await_pong(&self, source: &mut WsSource) -> Result<(), ClientError> {
        let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                frame = source.next() => frame,
                _ = &mut deadline => {
                    return Err(ClientError::Handshake("no pong from server".into()));
                }
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let env = Envelope::decode(text.as_str())?;
                    if let Some(error) = env.error {
                        return Err(ClientError::Server(error));
                    }
                    if env.data_str() == Some("pong") {
                        return Ok(());
                    }
                    self.dispatch(env);
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn connection_loop(
        self,
        first: (WsSink, WsSource),
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
        done: watch::Sender<bool>,
    ) {
        let mut conn = Some(first);
        loop {
            let (sink, source) = match conn.take() {
                Some(c) => c,
                None => match self.open().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(id = %self.inner.id, error = %e, "Reconnect failed");
                        if self.wait_restart(&mut shutdown).await {
                            continue;
                        }
                        break;
                    }
                },
            };

            let result = self
                .run_connection(sink, source, &mut outbound, &mut shutdown)
                .await;
            if let Some(on_close) = &self.inner.options.hooks.on_close {
                on_close();
            }

            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!(id = %self.inner.id, error = %e, "Connection lost");
                    if !self.wait_restart(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        done.send_replace(true);
        info!(id = %self.inner.id, "Client stopped");
    }

    /// Sleep before the next reconnect. False means stop.
    async fn wait_restart(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if !self.inner.options.autorestart || *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.inner.options.restart_every) => true,
            _ = shutdown.changed() => false,
        }
    }

    /// Ok when closed locally, Err when the transport failed.
    async fn run_connection(
        &self,
        mut sink: WsSink,
        mut source: WsSource,
        outbound: &mut mpsc::UnboundedReceiver<Envelope>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_text(text),
                        Err(_) => debug!(id = %self.inner.id, "Ignoring non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                queued = outbound.recv() => match queued {
                    Some(env) => sink.send(text_frame(&env)?).await?,
                    None => return Ok(()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(env) => self.dispatch(env),
            Err(e) => warn!(id = %self.inner.id, error = %e, "Undecodable frame"),
        }
    }

    /// Route one inbound envelope: data hook, acknowledgement, identity hook,
    /// topic handler.
    fn dispatch(&self, mut env: Envelope) {
        let hooks = &self.inner.options.hooks;
        if let Some(on_data) = &hooks.on_data {
            on_data(&env);
        }

        if let Some(error) = &env.error {
            warn!(id = %self.inner.id, error = %error, "Server reported an error");
            return;
        }

        if let Some(event_id) = env.event_id.clone() {
            if let Err(e) = self.publish(&event_id, Envelope::ack(self.id()).to_value()) {
                debug!(id = %self.inner.id, error = %e, "Could not acknowledge event");
            }
        }

        if env.to_id.as_deref() == Some(self.id()) {
            if let Some(on_id) = &hooks.on_id {
                env.to_id = None;
                on_id(env);
                return;
            }
        }

        let Some(topic) = env.topic.clone() else {
            return;
        };
        let entry = self
            .inner
            .handlers
            .get(&topic)
            .map(|entry| (entry.handler.clone(), entry.name.clone()));
        if let Some((handler, name)) = entry {
            let subscription = ClientSubscription {
                client: self.clone(),
                topic,
                name,
            };
            handler(env, &subscription);
        }
    }
}

fn text_frame(env: &Envelope) -> Result<Message, ClientError> {
    Ok(Message::Text(env.encode()?.into()))
}

fn settle<R, E>(
    outcome: Result<Envelope, ClientError>,
    event_id: &str,
    target: &str,
    on_recv: R,
    on_expire: E,
) -> Result<(), ClientError>
where
    R: FnOnce(Envelope),
    E: FnOnce(&str, &str),
{
    match outcome {
        Ok(reply) => {
            on_recv(reply);
            Ok(())
        }
        Err(ClientError::Bus(BusError::Timeout { .. })) => {
            on_expire(event_id, target);
            Ok(())
        }
        Err(e) => {
            on_expire(event_id, target);
            Err(e)
        }
    }
}
