//! # Federation
//!
//! Two servers on ephemeral ports:
//!
//! ```text
//!   client ── B ◀══ links ══▶ A ── in-process subscribers
//! ```
//!
//! Covers the join handshake, directory exchange, one-hop topic forwarding
//! with the `from_publisher` loop guard, point-to-point forwarding and
//! server-to-server messages.

#[cfg(test)]
mod tests {
    use crate::fixtures::{server_config, start_server, start_server_with, wait_until, ws_client};
    use mesh_client::ClientOptions;
    use mesh_server::{PeerConfig, Server, ServerHooks};
    use parking_lot::Mutex;
    use serde_json::json;
    use shared_types::Envelope;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn linked_pair() -> (Server, Server) {
        let a = start_server("server-a").await;
        let b = start_server("server-b").await;
        a.join_peer(b.addr(), false).await.unwrap();
        wait_until("link a -> b", || a.federation().is_linked(b.addr())).await;
        wait_until("link b -> a", || b.federation().is_linked(a.addr())).await;
        (a, b)
    }

    fn claims(server: &Server, peer: &Server, topic: &str) -> bool {
        server
            .federation()
            .directory()
            .peers_for_topic(topic)
            .contains(&peer.addr().to_string())
    }

    #[tokio::test]
    async fn test_join_links_both_ways() {
        let (a, b) = linked_pair().await;
        assert_eq!(a.federation().linked_peers(), vec![b.addr().to_string()]);
        assert_eq!(b.federation().linked_peers(), vec![a.addr().to_string()]);
        // Each link announces its server id on the other side
        assert!(b.bus().has_identity("server-a"));
        assert!(a.bus().has_identity("server-b"));
    }

    #[tokio::test]
    async fn test_configured_peers_are_joined() {
        let b = start_server("server-b").await;
        let mut config = server_config("server-a");
        config.peers = vec![PeerConfig {
            address: b.addr().to_string(),
            secure: false,
        }];
        let a = start_server_with(config, ServerHooks::default()).await;

        wait_until("configured join", || a.federation().is_linked(b.addr())).await;
        wait_until("dial back", || b.federation().is_linked(a.addr())).await;
    }

    #[tokio::test]
    async fn test_publish_forwarded_once() {
        let (a, b) = linked_pair().await;

        let local = Arc::new(Mutex::new(0));
        let counter = local.clone();
        a.subscribe("news", move |_, _| *counter.lock() += 1);

        let client = ws_client(&b, "reader").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .subscribe("news", move |env, _| {
                let _ = tx.send(env);
            })
            .unwrap();
        wait_until("a learns b's topic", || claims(&a, &b, "news")).await;
        wait_until("b learns a's topic", || claims(&b, &a, "news")).await;

        a.publish("news", json!({"headline": "federated"})).unwrap();

        let env = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.payload.get("headline"), Some(&json!("federated")));
        assert_eq!(env.from.as_deref(), Some("server-a"));
        assert_eq!(env.from_publisher.as_deref(), Some(a.addr()));

        // B must not send the tagged envelope back to A
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*local.lock(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_client_publish_reaches_local_subscriber() {
        let (a, b) = linked_pair().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.subscribe("alerts", move |env, _| {
            let _ = tx.send(env);
        });
        wait_until("b learns a's topic", || claims(&b, &a, "alerts")).await;

        let client = ws_client(&b, "sensor").await;
        client.publish("alerts", json!({"level": "high"})).unwrap();

        let env = rx.recv().await.unwrap();
        assert_eq!(env.from.as_deref(), Some("sensor"));
        assert_eq!(env.from_publisher.as_deref(), Some(b.addr()));
        assert_eq!(env.payload.get("level"), Some(&json!("high")));
    }

    #[tokio::test]
    async fn test_publish_to_id_across_servers() {
        let (a, b) = linked_pair().await;

        let seen = Arc::new(Mutex::new(Vec::<Envelope>::new()));
        let sink = seen.clone();
        let bob = mesh_client::Client::connect(
            ClientOptions::new(b.addr())
                .with_id("bob")
                .on_id(move |env| sink.lock().push(env)),
        )
        .await
        .unwrap();
        // Subscribing triggers a directory advertisement carrying the identity
        bob.subscribe("inbox", |_, _| {}).unwrap();
        wait_until("a learns bob", || {
            a.federation().directory().peers_for_id("bob") == vec![b.addr().to_string()]
        })
        .await;

        let reply = a
            .publish_to_id_wait("bob", json!({"note": "hi bob"}))
            .await
            .unwrap();
        assert_eq!(reply.from.as_deref(), Some("bob"));

        wait_until("bob's on_id", || seen.lock().len() == 1).await;
        assert_eq!(seen.lock()[0].payload.get("note"), Some(&json!("hi bob")));
        assert_eq!(seen.lock()[0].from.as_deref(), Some("server-a"));
        assert_eq!(a.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found_everywhere() {
        let (a, _b) = linked_pair().await;
        assert!(a.publish_to_id("nobody", json!("?")).is_err());
    }

    #[tokio::test]
    async fn test_remove_topic_withdraws_from_peer() {
        let (a, b) = linked_pair().await;
        b.subscribe("temp", |_, _| {});
        wait_until("a learns topic", || claims(&a, &b, "temp")).await;

        assert_eq!(b.remove_topic("temp"), 1);
        wait_until("a forgets topic", || !claims(&a, &b, "temp")).await;
    }

    #[tokio::test]
    async fn test_publish_to_server() {
        let received = Arc::new(Mutex::new(Vec::<Envelope>::new()));
        let sink = received.clone();
        let b = start_server_with(
            server_config("server-b"),
            ServerHooks::new().on_server_data(move |env| sink.lock().push(env)),
        )
        .await;
        let a = start_server("server-a").await;

        a.publish_to_server(b.addr(), json!({"cmd": "reload"}), false)
            .await
            .unwrap();

        wait_until("server data", || received.lock().len() == 1).await;
        assert_eq!(received.lock()[0].payload.get("cmd"), Some(&json!("reload")));
        assert!(a.federation().is_linked(b.addr()));
    }

    #[tokio::test]
    async fn test_client_relays_to_server() {
        let received = Arc::new(Mutex::new(Vec::<Envelope>::new()));
        let sink = received.clone();
        let b = start_server_with(
            server_config("server-b"),
            ServerHooks::new().on_server_data(move |env| sink.lock().push(env)),
        )
        .await;
        let a = start_server("server-a").await;

        let client = ws_client(&a, "operator").await;
        client
            .publish_to_server(b.addr(), json!("drain"), false)
            .unwrap();

        wait_until("relayed server data", || received.lock().len() == 1).await;
        assert_eq!(received.lock()[0].data, Some(json!("drain")));
    }
}
