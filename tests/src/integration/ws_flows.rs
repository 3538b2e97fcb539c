//! # WebSocket Flows
//!
//! `mesh_client::Client` against a live server:
//!
//! 1. Handshake and identity binding
//! 2. Topic delivery from the server and between clients
//! 3. Request/reply correlation between two clients
//! 4. Reconnect with handler replay

#[cfg(test)]
mod tests {
    use crate::fixtures::{start_server, ws_client, ws_client_with, wait_until};
    use mesh_client::{Client, ClientError, ClientOptions};
    use parking_lot::Mutex;
    use serde_json::json;
    use shared_types::Envelope;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_handshake_binds_identity() {
        let server = start_server("srv").await;
        let client = ws_client(&server, "c1").await;

        assert_eq!(client.id(), "c1");
        assert!(server.bus().has_identity("c1"));

        client.close();
        client.done().await;
        wait_until("identity release", || !server.bus().has_identity("c1")).await;
    }

    #[tokio::test]
    async fn test_duplicate_identity_is_rejected() {
        let server = start_server("srv").await;
        let first = ws_client(&server, "c1").await;

        let second = Client::connect(ClientOptions::new(server.addr()).with_id("c1")).await;
        match second {
            Err(ClientError::Server(message)) => {
                assert_eq!(message, "identity c1 already connected")
            }
            other => panic!("expected server error, got {:?}", other.map(|c| c.id().to_string())),
        }

        // The first binding still receives
        let (tx, mut rx) = mpsc::unbounded_channel();
        first
            .subscribe("news", move |env, _| {
                let _ = tx.send(env);
            })
            .unwrap();
        wait_until("subscription", || server.bus().subscriber_count("news") == 1).await;
        server.publish("news", json!("still here")).unwrap();
        assert_eq!(rx.recv().await.unwrap().data, Some(json!("still here")));
    }

    #[tokio::test]
    async fn test_server_publish_reaches_client_with_sender() {
        let server = start_server("srv").await;
        let client = ws_client(&server, "c1").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .subscribe("news", move |env, _| {
                let _ = tx.send(env);
            })
            .unwrap();
        wait_until("subscription", || server.bus().subscriber_count("news") == 1).await;

        server.publish("news", json!({"headline": "hello"})).unwrap();
        let env = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.topic.as_deref(), Some("news"));
        assert_eq!(env.from.as_deref(), Some("srv"));
        assert_eq!(env.payload.get("headline"), Some(&json!("hello")));
    }

    #[tokio::test]
    async fn test_client_to_client_publish() {
        let server = start_server("srv").await;
        let listener = ws_client(&server, "listener").await;
        let talker = ws_client(&server, "talker").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .subscribe("chat", move |env, _| {
                let _ = tx.send(env);
            })
            .unwrap();
        wait_until("subscription", || server.bus().subscriber_count("chat") == 1).await;

        talker.publish("chat", json!({"text": "hi"})).unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(env.from.as_deref(), Some("talker"));
        assert_eq!(env.payload.get("text"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_publish_to_id_wait_recv_between_clients() {
        let server = start_server("srv").await;

        let seen = Arc::new(Mutex::new(Vec::<Envelope>::new()));
        let sink = seen.clone();
        let _bob = ws_client_with(
            ClientOptions::new(server.addr())
                .with_id("bob")
                .on_id(move |env| sink.lock().push(env)),
        )
        .await;
        let alice = ws_client(&server, "alice").await;

        let reply = Arc::new(Mutex::new(None));
        let slot = reply.clone();
        let started = Instant::now();
        alice
            .publish_to_id_wait_recv(
                "bob",
                json!({"question": "ready?"}),
                move |env| *slot.lock() = Some(env),
                |event_id, _| panic!("no reply for {event_id}"),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        let reply = reply.lock().clone().unwrap();
        assert_eq!(reply.from.as_deref(), Some("bob"));
        assert_eq!(reply.payload.get("ok"), Some(&json!("done")));

        wait_until("on_id delivery", || seen.lock().len() == 1).await;
        assert_eq!(seen.lock()[0].from.as_deref(), Some("alice"));
        // The correlation topic is gone again
        wait_until("correlation teardown", || server.all_topics().is_empty()).await;
    }

    #[tokio::test]
    async fn test_publish_wait_without_responder_expires() {
        let server = start_server("srv").await;
        let client = ws_client(&server, "c1").await;

        let expired = Arc::new(Mutex::new(None));
        let slot = expired.clone();
        client
            .publish_wait_recv(
                "nobody",
                json!("anyone?"),
                |_| panic!("nobody answers"),
                move |event_id, topic| {
                    *slot.lock() = Some((event_id.to_string(), topic.to_string()))
                },
            )
            .await
            .unwrap();

        let (event_id, topic) = expired.lock().clone().unwrap();
        assert_eq!(topic, "nobody");
        wait_until("correlation teardown", || {
            server.bus().subscriber_count(&event_id) == 0
        })
        .await;
    }

    #[tokio::test]
    async fn test_publish_wait_answered_by_server_subscriber() {
        let server = start_server("srv").await;
        let responder = server.clone();
        server.subscribe("jobs", move |env, _| {
            if let Some(event_id) = env.event_id {
                responder.publish(&event_id, json!({"result": 42})).unwrap();
            }
        });

        let client = ws_client(&server, "c1").await;
        let reply = client.publish_wait("jobs", json!({"n": 1})).await.unwrap();
        assert_eq!(reply.payload.get("result"), Some(&json!(42)));
        assert_eq!(reply.from.as_deref(), Some("srv"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let server = start_server("srv").await;
        let client = ws_client(&server, "c1").await;

        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let subscription = client
            .subscribe("news", move |_, _| *counter.lock() += 1)
            .unwrap();
        let _keep = client.subscribe("other", |_, _| {}).unwrap();
        wait_until("subscription", || server.bus().subscriber_count("news") == 1).await;

        server.publish("news", json!("one")).unwrap();
        wait_until("first delivery", || *count.lock() == 1).await;

        subscription.unsubscribe().unwrap();
        wait_until("unsubscribe", || server.bus().subscriber_count("news") == 0).await;
        assert_eq!(server.publish("news", json!("two")).unwrap(), 0);
        assert!(server.bus().has_identity("c1"));
    }

    #[tokio::test]
    async fn test_named_delivery() {
        let server = start_server("srv").await;
        let worker = ws_client(&server, "worker").await;
        let boss = ws_client(&server, "boss").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker
            .subscribe_named("jobs", "w1", move |env, _| {
                let _ = tx.send(env);
            })
            .unwrap();
        wait_until("subscription", || server.bus().subscriber_count("jobs") == 1).await;

        boss.send_to("w1", Some("jobs"), json!("do it")).unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(env.data, Some(json!("do it")));
        assert_eq!(env.from.as_deref(), Some("boss"));
    }

    #[tokio::test]
    async fn test_remove_topic_from_client() {
        let server = start_server("srv").await;
        let a = ws_client(&server, "a").await;
        let b = ws_client(&server, "b").await;
        a.subscribe("doomed", |_, _| {}).unwrap();
        b.subscribe("doomed", |_, _| {}).unwrap();
        wait_until("subscriptions", || server.bus().subscriber_count("doomed") == 2).await;

        a.remove_topic("doomed").unwrap();
        wait_until("topic removal", || server.bus().subscriber_count("doomed") == 0).await;
        assert!(!server.all_topics().contains(&"doomed".to_string()));
    }
}
