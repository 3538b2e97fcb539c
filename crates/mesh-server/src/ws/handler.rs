//! WebSocket connection handler.
//!
//! One read loop per connection plus a writer task draining the connection's
//! outbound queue. Replies and bus deliveries share that queue, so a client
//! sees them in the order they were produced.
//!
//! Protocol errors are answered in-band with `{"error": "..."}` and never
//! close the connection.

use crate::server::Server;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use shared_bus::{ConnectionSink, DeliveryTarget};
use shared_types::{Action, BusError, Envelope};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Upgrade handler mounted on the WebSocket path.
pub async fn ws_upgrade(
    State(server): State<Server>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !server.hooks().allow_upgrade(&headers) {
        let refused = BusError::HandshakeFailure("upgrade refused".into());
        warn!(error = %refused, "WebSocket upgrade rejected");
        return (StatusCode::FORBIDDEN, refused.to_string()).into_response();
    }
    ws.on_upgrade(move |socket| ConnectionHandler::new(server).handle(socket))
}

/// State of one WebSocket connection.
pub struct ConnectionHandler {
    server: Server,
    sink: ConnectionSink,
    outbound: Option<mpsc::UnboundedReceiver<Envelope>>,
    identity: Option<String>,
}

impl ConnectionHandler {
    pub fn new(server: Server) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            server,
            sink: ConnectionSink::new(tx),
            outbound: Some(rx),
            identity: None,
        }
    }

    /// Handle a WebSocket connection until it closes.
    pub async fn handle(mut self, socket: WebSocket) {
        let connection = self.sink.id();
        info!(%connection, "New WebSocket connection");

        let (mut ws_tx, mut ws_rx) = socket.split();
        let mut outbound = match self.outbound.take() {
            Some(rx) => rx,
            None => return,
        };

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(%connection, error = %e, "Dropping unencodable envelope");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    debug!(%connection, error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(frame) = ws_rx.next().await {
            let keep_open = match frame {
                Ok(Message::Text(text)) => self.handle_text(&text),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => self.handle_text(&text),
                    Err(_) => {
                        self.reply_error(&BusError::MalformedEnvelope(
                            "binary frames must carry UTF-8 JSON".into(),
                        ));
                        true
                    }
                },
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    debug!(%connection, error = %e, "WebSocket read failed");
                    false
                }
            };
            if !keep_open {
                break;
            }
        }

        self.cleanup();
        writer.abort();
    }

    /// Returns `false` when the connection should be closed.
    fn handle_text(&mut self, text: &str) -> bool {
        let limit = self.server.config().max_message_size;
        if text.len() > limit {
            warn!(
                connection = %self.sink.id(),
                size = text.len(),
                max = limit,
                "Message exceeds size limit"
            );
            self.reply_error(&BusError::MalformedEnvelope(format!(
                "message too large: {} bytes (max: {})",
                text.len(),
                limit
            )));
            return true;
        }

        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reply_error(&e);
                return true;
            }
        };

        if !self.server.hooks().accept_data(&envelope, self.sink.id()) {
            info!(connection = %self.sink.id(), "Connection closed by data hook");
            return false;
        }

        if let Err(e) = self.dispatch(envelope) {
            warn!(connection = %self.sink.id(), identity = ?self.identity, error = %e, "Protocol error");
            self.reply_error(&e);
        }
        true
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let name = envelope.action.as_deref().ok_or_else(|| BusError::missing("action"))?;
        let action = Action::parse(name)
            .ok_or_else(|| BusError::MalformedEnvelope(format!("action {name} not handled")))?;
        debug!(connection = %self.sink.id(), %action, topic = ?envelope.topic, "Inbound action");

        match action {
            Action::Ping => self.ping(&envelope),
            Action::Publish => self.publish(envelope),
            Action::PublishToId => self.publish_to_id(envelope),
            Action::Subscribe => self.subscribe(&envelope),
            Action::Unsubscribe => self.unsubscribe(&envelope),
            Action::RemoveTopic => {
                let topic = required(&envelope.topic, "topic")?;
                self.server.remove_topic(topic);
                Ok(())
            }
            Action::SendTo => self.send_to(envelope),
            Action::PublishToServer => self.publish_to_server(envelope),
            Action::ServerMessage => self.server_message(envelope),
            Action::ServerSub => {
                let addr = required(&envelope.addr, "addr")?;
                self.server
                    .accept_peer(addr, envelope.secure.unwrap_or(false));
                Ok(())
            }
            Action::Topics => {
                let addr = required(&envelope.addr, "addr")?;
                let topics = envelope.topics.clone().ok_or_else(|| BusError::missing("topics"))?;
                self.server.federation().directory().replace(
                    addr,
                    topics,
                    envelope.ids.clone().unwrap_or_default(),
                );
                Ok(())
            }
            Action::RemoveNodeTopic => {
                let addr = required(&envelope.addr, "addr")?;
                let topic = required(&envelope.topic, "topic")?;
                self.server.federation().directory().remove_topic(addr, topic);
                Ok(())
            }
        }
    }

    fn ping(&mut self, envelope: &Envelope) -> Result<(), BusError> {
        let from = required(&envelope.from, "from")?;
        self.bind(from)?;
        self.reply(Envelope::pong());
        Ok(())
    }

    fn publish(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let topic = required(&envelope.topic, "topic")?.to_string();
        let payload = self.payload(envelope)?;
        self.server.publish_envelope(&topic, payload);
        Ok(())
    }

    fn publish_to_id(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let id = required(&envelope.id, "id")?.to_string();
        let payload = self.payload(envelope)?;
        self.server.route_to_id(&id, payload)
    }

    fn subscribe(&mut self, envelope: &Envelope) -> Result<(), BusError> {
        let topic = required(&envelope.topic, "topic")?;
        match (envelope.from.as_deref(), self.identity.clone()) {
            (Some(from), _) => self.bind(from)?,
            (None, Some(_)) => {}
            (None, None) => return Err(BusError::missing("from")),
        }

        if self
            .server
            .bus()
            .subscribe_connection(topic, &self.sink, envelope.name.clone())
            && envelope.from_publisher.is_none()
        {
            self.server.advertise_topics();
        }
        Ok(())
    }

    fn unsubscribe(&mut self, envelope: &Envelope) -> Result<(), BusError> {
        let topic = required(&envelope.topic, "topic")?;
        if self
            .server
            .bus()
            .unsubscribe_connection(topic, self.sink.id())
        {
            if self.server.bus().identity_of(self.sink.id()).is_none() {
                self.identity = None;
            }
            self.server.advertise_topics();
        }
        Ok(())
    }

    fn send_to(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let name = required(&envelope.name, "name")?;
        let key = match envelope.topic.as_deref().filter(|t| !t.is_empty()) {
            Some(topic) => format!("{topic}:{name}"),
            None => name.to_string(),
        };
        let payload = self.payload(envelope)?;
        self.server.send_to_named_envelope(&key, payload);
        Ok(())
    }

    fn publish_to_server(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let addr = required(&envelope.addr, "addr")?.to_string();
        let secure = envelope.secure.unwrap_or(false);
        let data = envelope.data.ok_or_else(|| BusError::missing("data"))?;

        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.publish_to_server(&addr, data, secure).await {
                warn!(peer = %addr, error = %e, "Relay to server failed");
            }
        });
        Ok(())
    }

    fn server_message(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let addr = required(&envelope.addr, "addr")?;
        if !self.server.federation().is_self(addr) {
            debug!(addr, "Server message for another server ignored");
            return Ok(());
        }
        let data = envelope.data.ok_or_else(|| BusError::missing("data"))?;
        self.server.receive_server_data(Envelope::from_payload(data)?);
        Ok(())
    }

    /// The envelope carried in `data`, with sender and forwarding tag filled in.
    fn payload(&self, envelope: Envelope) -> Result<Envelope, BusError> {
        let data = envelope.data.ok_or_else(|| BusError::missing("data"))?;
        let mut payload = Envelope::from_payload(data)?;
        if payload.from.is_none() {
            payload.from = envelope.from.or_else(|| self.identity.clone());
        }
        if payload.from_publisher.is_none() {
            payload.from_publisher = envelope.from_publisher;
        }
        Ok(payload)
    }

    fn bind(&mut self, identity: &str) -> Result<(), BusError> {
        if self.identity.as_deref() == Some(identity)
            && self.server.bus().has_identity(identity)
        {
            return Ok(());
        }
        self.server
            .bus()
            .register_identity(identity, DeliveryTarget::Connection(self.sink.clone()))?;
        debug!(connection = %self.sink.id(), %identity, "Identity bound");
        self.identity = Some(identity.to_string());
        Ok(())
    }

    fn reply(&self, envelope: Envelope) {
        if self.sink.send(envelope).is_err() {
            debug!(connection = %self.sink.id(), "Reply dropped, writer gone");
        }
    }

    fn reply_error(&self, error: &BusError) {
        self.reply(Envelope::error_reply(error.to_string()));
    }

    /// Purge the connection and release its identity.
    fn cleanup(&mut self) {
        let connection = self.sink.id();
        self.identity = None;
        match self.server.bus().remove_connection(connection) {
            Some(identity) => {
                info!(%connection, %identity, "Connection closed");
                self.server.hooks().closed(&identity);
            }
            None => info!(%connection, "Connection closed"),
        }
        self.server.advertise_topics();
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, BusError> {
    field
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BusError::missing(name))
}

#[cfg(test)]
mod tests {
    use crate::domain::config::ServerConfig;
    use crate::hooks::ServerHooks;
    use crate::server::Server;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(hooks: ServerHooks) -> Server {
        let mut config = ServerConfig::default();
        config.id = "srv".into();
        config.port = 0;
        let (server, listener) = Server::bind(config, hooks).await.unwrap();
        tokio::spawn(server.clone().serve(listener));
        server
    }

    async fn connect(server: &Server) -> Socket {
        let url = format!("ws://{}{}", server.addr(), server.config().ws_path);
        let (socket, _) = connect_async(url).await.unwrap();
        socket
    }

    async fn send(socket: &mut Socket, value: Value) {
        socket.send(Message::text(value.to_string())).await.unwrap();
    }

    async fn recv(socket: &mut Socket) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("no frame within 2s")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let server = start(ServerHooks::default()).await;
        let mut ws = connect(&server).await;

        send(&mut ws, json!({"action": "ping", "from": "c1"})).await;
        assert_eq!(recv(&mut ws).await, json!({"data": "pong"}));
        assert!(server.bus().has_identity("c1"));
    }

    #[tokio::test]
    async fn test_duplicate_ping_keeps_first_binding() {
        let server = start(ServerHooks::default()).await;
        let mut first = connect(&server).await;
        let mut second = connect(&server).await;

        send(&mut first, json!({"action": "ping", "from": "c1"})).await;
        recv(&mut first).await;
        send(&mut second, json!({"action": "ping", "from": "c1"})).await;

        let reply = recv(&mut second).await;
        assert_eq!(reply["error"], json!("identity c1 already connected"));

        // Deliveries to c1 still reach the first connection
        server.publish_to_id("c1", json!("hello")).unwrap();
        let delivered = recv(&mut first).await;
        assert_eq!(delivered["data"], json!("hello"));
        assert_eq!(delivered["to_id"], json!("c1"));
    }

    #[tokio::test]
    async fn test_second_identity_on_connection_rejected() {
        let server = start(ServerHooks::default()).await;
        let mut ws = connect(&server).await;

        send(&mut ws, json!({"action": "ping", "from": "c1"})).await;
        recv(&mut ws).await;
        send(&mut ws, json!({"action": "ping", "from": "c2"})).await;
        assert_eq!(recv(&mut ws).await["error"], json!("connection already bound to c1"));
        assert_eq!(server.bus().identities(), vec!["c1".to_string()]);

        drop(ws);
        wait_until(|| server.bus().identities().is_empty()).await;
    }

    #[tokio::test]
    async fn test_protocol_errors_are_in_band() {
        let server = start(ServerHooks::default()).await;
        let mut ws = connect(&server).await;

        send(&mut ws, json!({"action": "pub", "data": "x"})).await;
        assert_eq!(recv(&mut ws).await["error"], json!("topic missing"));

        send(&mut ws, json!({"action": "dance"})).await;
        assert_eq!(recv(&mut ws).await["error"], json!("action dance not handled"));

        send(&mut ws, json!({"topic": "x"})).await;
        assert_eq!(recv(&mut ws).await["error"], json!("action missing"));

        ws.send(Message::text("{not json")).await.unwrap();
        assert!(recv(&mut ws).await["error"].is_string());

        // Still usable afterwards
        send(&mut ws, json!({"action": "ping", "from": "c1"})).await;
        assert_eq!(recv(&mut ws).await, json!({"data": "pong"}));
    }

    #[tokio::test]
    async fn test_subscribe_then_server_publish() {
        let server = start(ServerHooks::default()).await;
        let mut ws = connect(&server).await;

        send(&mut ws, json!({"action": "sub", "topic": "news", "from": "c1"})).await;
        wait_until(|| server.bus().subscriber_count("news") == 1).await;

        server.publish("news", json!({"headline": "hi"})).unwrap();
        let env = recv(&mut ws).await;
        assert_eq!(env["topic"], json!("news"));
        assert_eq!(env["from"], json!("srv"));
        assert_eq!(env["headline"], json!("hi"));
    }

    #[tokio::test]
    async fn test_client_publish_fills_sender() {
        let server = start(ServerHooks::default()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.subscribe("jobs", move |env, _| {
            let _ = tx.send(env);
        });

        let mut ws = connect(&server).await;
        send(&mut ws, json!({"action": "ping", "from": "c1"})).await;
        recv(&mut ws).await;
        send(&mut ws, json!({"action": "pub", "topic": "jobs", "data": {"n": 1}})).await;

        let env = rx.recv().await.unwrap();
        assert_eq!(env.from.as_deref(), Some("c1"));
        assert_eq!(env.payload.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_close_releases_identity_and_topics() {
        let closed = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = closed.clone();
        let server = start(ServerHooks::new().on_close(move |id| seen.lock().push(id.to_string()))).await;

        let mut ws = connect(&server).await;
        send(&mut ws, json!({"action": "sub", "topic": "news", "from": "c1"})).await;
        wait_until(|| server.bus().subscriber_count("news") == 1).await;

        ws.close(None).await.unwrap();
        wait_until(|| !server.bus().has_identity("c1")).await;
        assert_eq!(server.bus().subscriber_count("news"), 0);
        wait_until(|| closed.lock().len() == 1).await;
        assert_eq!(closed.lock()[0], "c1");
    }

    #[tokio::test]
    async fn test_unsubscribe_last_topic_releases_identity() {
        let server = start(ServerHooks::default()).await;
        let mut ws = connect(&server).await;

        send(&mut ws, json!({"action": "sub", "topic": "news", "from": "c1"})).await;
        wait_until(|| server.bus().has_identity("c1")).await;
        send(&mut ws, json!({"action": "unsub", "topic": "news"})).await;
        wait_until(|| !server.bus().has_identity("c1")).await;

        // The identity is free for another connection
        let mut other = connect(&server).await;
        send(&mut other, json!({"action": "ping", "from": "c1"})).await;
        assert_eq!(recv(&mut other).await, json!({"data": "pong"}));
    }

    #[tokio::test]
    async fn test_upgrade_gate_rejects() {
        let server = start(ServerHooks::new().before_upgrade(|_| false)).await;
        let url = format!("ws://{}{}", server.addr(), server.config().ws_path);
        match connect_async(url).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 403);
            }
            other => panic!("expected a refused upgrade, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_data_hook_closes_connection() {
        let server = start(ServerHooks::new().on_data(|env, _| env.action.as_deref() != Some("pub"))).await;
        let mut ws = connect(&server).await;

        send(&mut ws, json!({"action": "pub", "topic": "x", "data": "y"})).await;
        let next = tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap();
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    }

    #[tokio::test]
    async fn test_publish_to_own_id_over_socket() {
        let got = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = got.clone();
        let server = start(ServerHooks::new().on_id(move |env| sink.lock().push(env))).await;

        let mut ws = connect(&server).await;
        send(&mut ws, json!({"action": "sub", "topic": "evt-9", "from": "c1"})).await;
        wait_until(|| server.bus().subscriber_count("evt-9") == 1).await;
        send(
            &mut ws,
            json!({"action": "pub_id", "id": "srv", "data": {"event_id": "evt-9", "q": 1}}),
        )
        .await;

        let ack = recv(&mut ws).await;
        assert_eq!(ack["ok"], json!("done"));
        assert_eq!(ack["from"], json!("srv"));
        wait_until(|| got.lock().len() == 1).await;
    }

    #[tokio::test]
    async fn test_send_to_named_over_socket() {
        let server = start(ServerHooks::default()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.subscribe_named("jobs", "worker", move |env, _| {
            let _ = tx.send(env);
        });

        let mut ws = connect(&server).await;
        send(
            &mut ws,
            json!({"action": "sendTo", "topic": "jobs", "name": "worker", "from": "c1", "data": "go"}),
        )
        .await;
        let env = rx.recv().await.unwrap();
        assert_eq!(env.data, Some(json!("go")));
        assert_eq!(env.from.as_deref(), Some("c1"));
    }
}
