//! Polling RPC client.
//!
//! Emulates push delivery over JSON-RPC: subscriptions are registered with
//! the server, which queues matching envelopes per identity; a background
//! task polls that queue every `poll_interval`.

use crate::error::ClientError;
use crate::options::RpcClientOptions;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_bus::PendingReplies;
use shared_types::rpc::{
    METHOD_PING, METHOD_POLL, METHOD_PUBLISH, METHOD_PUBLISH_TO_ID, METHOD_REMOVE_TOPIC,
    METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE,
};
use shared_types::{Action, BusError, Envelope, RpcRequest, RpcResponse};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Handler invoked for polled envelopes of a subscribed topic.
pub type RpcHandler = Arc<dyn Fn(Envelope, &RpcSubscription) + Send + Sync>;

/// JSON-RPC request structure.
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, T: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC error structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Subscription handle passed to RPC handlers.
#[derive(Clone)]
pub struct RpcSubscription {
    client: RpcClient,
    topic: String,
}

impl RpcSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        self.client.unsubscribe(&self.topic).await
    }
}

struct RpcInner {
    id: String,
    url: Url,
    options: RpcClientOptions,
    http: reqwest::Client,
    request_id: AtomicU64,
    handlers: DashMap<String, RpcHandler>,
    pending: Arc<PendingReplies>,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// Polling RPC bus client. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<RpcInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url.as_str())
            .finish()
    }
}

impl RpcClient {
    /// Register the identity with the server and start polling.
    pub async fn connect(options: RpcClientOptions) -> Result<Self, ClientError> {
        let url = options.url()?;
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let client = Self {
            inner: Arc::new(RpcInner {
                id: options.id.clone(),
                url,
                http,
                request_id: AtomicU64::new(1),
                handlers: DashMap::new(),
                pending: Arc::new(PendingReplies::new(options.reply_timeout)),
                options,
                shutdown: shutdown_tx,
                done: done_rx,
            }),
        };

        loop {
            match client.register().await {
                Ok(()) => break,
                Err(e) if client.inner.options.autorestart && e.is_transport() => {
                    warn!(
                        url = %client.inner.url,
                        error = %e,
                        retry_in_secs = client.inner.options.restart_every.as_secs_f64(),
                        "RPC connection failed, will retry"
                    );
                    tokio::time::sleep(client.inner.options.restart_every).await;
                }
                Err(e) => return Err(e),
            }
        }

        tokio::spawn(client.clone().poll_loop(shutdown_rx, done_tx));
        Ok(client)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn next_id(&self) -> u64 {
        self.inner.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Call one bus method.
    async fn call(&self, method: &str, params: RpcRequest) -> Result<RpcResponse, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params: [params],
            id: self.next_id(),
        };

        let response = self
            .inner
            .http
            .post(self.inner.url.clone())
            .json(&request)
            .send()
            .await?;

        let rpc_response: JsonRpcResponse<RpcResponse> = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;

        if let Some(error) = rpc_response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        let result = rpc_response
            .result
            .ok_or_else(|| ClientError::Parse("missing result in response".to_string()))?;
        match result.error {
            Some(error) => Err(ClientError::Server(error)),
            None => Ok(result),
        }
    }

    fn request(&self, action: Action) -> RpcRequest {
        RpcRequest::new(action.as_str(), &self.inner.id)
    }

    /// Ping with the identity, then replay the handler table.
    async fn register(&self) -> Result<(), ClientError> {
        self.call(METHOD_PING, self.request(Action::Ping)).await?;
        let topics: Vec<String> = self
            .inner
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for topic in &topics {
            self.call(
                METHOD_SUBSCRIBE,
                self.request(Action::Subscribe).with_topic(topic.as_str()),
            )
            .await?;
        }
        info!(id = %self.inner.id, url = %self.inner.url, topics = topics.len(), "RPC client registered");
        Ok(())
    }

    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<RpcSubscription, ClientError>
    where
        F: Fn(Envelope, &RpcSubscription) + Send + Sync + 'static,
    {
        self.call(
            METHOD_SUBSCRIBE,
            self.request(Action::Subscribe).with_topic(topic),
        )
        .await?;
        self.inner
            .handlers
            .insert(topic.to_string(), Arc::new(handler));
        debug!(id = %self.inner.id, topic, "Subscribed over RPC");
        Ok(RpcSubscription {
            client: self.clone(),
            topic: topic.to_string(),
        })
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.inner.handlers.remove(topic);
        self.call(
            METHOD_UNSUBSCRIBE,
            self.request(Action::Unsubscribe).with_topic(topic),
        )
        .await?;
        // The server drops the queue and binding with the last topic.
        if self.inner.handlers.is_empty() {
            self.call(METHOD_PING, self.request(Action::Ping)).await?;
        }
        Ok(())
    }

    pub async fn publish(&self, topic: &str, data: Value) -> Result<(), ClientError> {
        self.call(
            METHOD_PUBLISH,
            self.request(Action::Publish).with_topic(topic).with_data(data),
        )
        .await
        .map(drop)
    }

    pub async fn publish_to_id(&self, id: &str, data: Value) -> Result<(), ClientError> {
        self.call(
            METHOD_PUBLISH_TO_ID,
            self.request(Action::PublishToId).with_id(id).with_data(data),
        )
        .await
        .map(drop)
    }

    pub async fn remove_topic(&self, topic: &str) -> Result<(), ClientError> {
        self.inner.handlers.remove(topic);
        self.call(
            METHOD_REMOVE_TOPIC,
            self.request(Action::RemoveTopic).with_topic(topic),
        )
        .await
        .map(drop)
    }

    pub async fn publish_wait(&self, topic: &str, data: Value) -> Result<Envelope, ClientError> {
        let (_, outcome) = self.wait_reply(topic, data, Target::Topic(topic)).await;
        outcome
    }

    pub async fn publish_to_id_wait(&self, id: &str, data: Value) -> Result<Envelope, ClientError> {
        let (_, outcome) = self.wait_reply(id, data, Target::Identity(id)).await;
        outcome
    }

    /// Exactly one of `on_recv` and `on_expire(event_id, topic)` is called.
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
        let (event_id, outcome) = self.wait_reply(topic, data, Target::Topic(topic)).await;
        settle(outcome, &event_id, topic, on_recv, on_expire)
    }

    /// Exactly one of `on_recv` and `on_expire(event_id, id)` is called.
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
        let (event_id, outcome) = self.wait_reply(id, data, Target::Identity(id)).await;
        settle(outcome, &event_id, id, on_recv, on_expire)
    }

    async fn wait_reply(
        &self,
        label: &str,
        data: Value,
        target: Target<'_>,
    ) -> (String, Result<Envelope, ClientError>) {
        let (correlation_id, rx) = self.inner.pending.register(label);
        let event_id = correlation_id.topic();

        let mut payload = match Envelope::from_payload(data) {
            Ok(env) => env,
            Err(e) => return (event_id, Err(e.into())),
        };
        payload.event_id = Some(event_id.clone());
        payload.from = Some(self.inner.id.clone());

        let pending = self.inner.pending.clone();
        let subscribed = self
            .subscribe(&event_id, move |reply, _| {
                pending.complete(correlation_id, reply);
            })
            .await;

        let outcome = match subscribed {
            Ok(_) => {
                let sent = match target {
                    Target::Topic(topic) => self.publish(topic, payload.to_value()).await,
                    Target::Identity(id) => self.publish_to_id(id, payload.to_value()).await,
                };
                match sent {
                    Ok(()) => self
                        .inner
                        .pending
                        .wait(correlation_id, rx, None)
                        .await
                        .map_err(ClientError::from),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        self.inner.pending.cancel(&correlation_id);
        self.inner.handlers.remove(&event_id);
        if let Err(e) = self
            .call(
                METHOD_REMOVE_TOPIC,
                self.request(Action::RemoveTopic).with_topic(event_id.as_str()),
            )
            .await
        {
            warn!(%event_id, error = %e, "Could not remove correlation topic");
        }
        (event_id, outcome)
    }

    /// Stop polling. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Resolves once the poll task has ended.
    pub async fn done(&self) {
        let mut done = self.inner.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    async fn poll_loop(self, mut shutdown: watch::Receiver<bool>, done: watch::Sender<bool>) {
        let mut ticker = tokio::time::interval(self.inner.options.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'polling: loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            // Drain everything queued since the last tick.
            loop {
                match self.call(METHOD_POLL, self.request_poll()).await {
                    Ok(RpcResponse { data: Some(env), .. }) => self.dispatch(env).await,
                    Ok(_) => break,
                    Err(e) if e.is_transport() => {
                        warn!(id = %self.inner.id, error = %e, "RPC connection lost");
                        if let Some(on_close) = &self.inner.options.hooks.on_close {
                            on_close();
                        }
                        if !self.reconnect(&mut shutdown).await {
                            break 'polling;
                        }
                        break;
                    }
                    Err(ClientError::Server(message)) => {
                        // Reaped or restarted server: register again.
                        debug!(id = %self.inner.id, %message, "Poll rejected, registering again");
                        if let Err(e) = self.register().await {
                            warn!(id = %self.inner.id, error = %e, "Re-registration failed");
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(id = %self.inner.id, error = %e, "Error polling messages");
                        break;
                    }
                }
            }
        }

        done.send_replace(true);
        info!(id = %self.inner.id, "RPC client stopped");
    }

    fn request_poll(&self) -> RpcRequest {
        RpcRequest::new("poll", &self.inner.id)
    }

    /// Retry registration every `restart_every`. False means stop polling.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if !self.inner.options.autorestart || *shutdown.borrow() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.options.restart_every) => {}
                _ = shutdown.changed() => return false,
            }
            match self.register().await {
                Ok(()) => {
                    info!(id = %self.inner.id, "RPC client reconnected");
                    return true;
                }
                Err(e) => warn!(id = %self.inner.id, error = %e, "Failed to reconnect"),
            }
        }
    }

    async fn dispatch(&self, mut env: Envelope) {
        // Late deliveries for topics already dropped locally.
        if let Some(topic) = &env.topic {
            if !self.inner.handlers.contains_key(topic) {
                return;
            }
        }

        let hooks = &self.inner.options.hooks;
        if let Some(on_data) = &hooks.on_data {
            on_data(&env);
        }

        if let Some(event_id) = env.event_id.clone() {
            if let Err(e) = self
                .publish(&event_id, Envelope::ack(self.id()).to_value())
                .await
            {
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
        let handler = self.inner.handlers.get(&topic).map(|h| h.value().clone());
        if let Some(handler) = handler {
            let subscription = RpcSubscription {
                client: self.clone(),
                topic,
            };
            handler(env, &subscription);
        }
    }
}

enum Target<'a> {
    Topic(&'a str),
    Identity(&'a str),
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
