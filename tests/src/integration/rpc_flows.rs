//! # RPC Flows
//!
//! `mesh_client::RpcClient` polling a live server, mixed with WebSocket
//! clients and in-process subscribers.

#[cfg(test)]
mod tests {
    use crate::fixtures::{
        rpc_client, server_config, start_server, start_server_with, wait_until, ws_client,
    };
    use mesh_client::{RpcClient, RpcClientOptions};
    use mesh_server::ServerHooks;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_rpc_client_receives_server_publish() {
        let server = start_server("srv").await;
        let client = rpc_client(&server, "r1").await;
        assert!(server.rpc().is_registered("r1"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .subscribe("news", move |env, _| {
                let _ = tx.send(env);
            })
            .await
            .unwrap();

        server.publish("news", json!({"n": 1})).unwrap();
        server.publish("news", json!({"n": 2})).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload.get("n"), Some(&json!(1)));
        assert_eq!(second.payload.get("n"), Some(&json!(2)));
        assert_eq!(first.from.as_deref(), Some("srv"));
    }

    #[tokio::test]
    async fn test_ws_to_rpc_wait_recv() {
        let server = start_server("srv").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _rpc = RpcClient::connect(
            RpcClientOptions::new(server.addr())
                .with_id("poller")
                .poll_interval(Duration::from_millis(20))
                .on_id(move |env| sink.lock().push(env)),
        )
        .await
        .unwrap();
        let ws = ws_client(&server, "pusher").await;

        let reply = ws
            .publish_to_id_wait("poller", json!({"job": "sync"}))
            .await
            .unwrap();
        assert_eq!(reply.from.as_deref(), Some("poller"));
        wait_until("on_id delivery", || seen.lock().len() == 1).await;
        assert_eq!(seen.lock()[0].payload.get("job"), Some(&json!("sync")));
    }

    #[tokio::test]
    async fn test_rpc_publish_reaches_ws_subscriber() {
        let server = start_server("srv").await;
        let ws = ws_client(&server, "listener").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        ws.subscribe("chat", move |env, _| {
            let _ = tx.send(env);
        })
        .unwrap();
        wait_until("subscription", || server.bus().subscriber_count("chat") == 1).await;

        let rpc = rpc_client(&server, "talker").await;
        rpc.publish("chat", json!({"text": "over http"})).await.unwrap();

        let env = rx.recv().await.unwrap();
        assert_eq!(env.from.as_deref(), Some("talker"));
        assert_eq!(env.payload.get("text"), Some(&json!("over http")));
    }

    #[tokio::test]
    async fn test_rpc_unsubscribe_keeps_registration() {
        let server = start_server("srv").await;
        let rpc = rpc_client(&server, "r1").await;
        let subscription = rpc.subscribe("news", |_, _| {}).await.unwrap();
        assert_eq!(server.bus().subscriber_count("news"), 1);

        subscription.unsubscribe().await.unwrap();
        assert_eq!(server.bus().subscriber_count("news"), 0);
        // The client pings again once its last topic is gone
        assert!(server.rpc().is_registered("r1"));
        assert!(server.bus().has_identity("r1"));
    }

    #[tokio::test]
    async fn test_idle_rpc_client_is_reaped() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let seen = closed.clone();
        let mut config = server_config("srv");
        config.rpc.client_ttl = Duration::from_millis(100);
        config.rpc.reap_interval = Duration::from_millis(25);
        let hooks = ServerHooks::new().on_close(move |id| seen.lock().push(id.to_string()));
        let server = start_server_with(config, hooks).await;

        let rpc = rpc_client(&server, "sleepy").await;
        rpc.subscribe("news", |_, _| {}).await.unwrap();
        rpc.close();
        rpc.done().await;

        wait_until("reap", || !server.rpc().is_registered("sleepy")).await;
        assert!(!server.bus().has_identity("sleepy"));
        assert_eq!(server.bus().subscriber_count("news"), 0);
        assert_eq!(closed.lock().as_slice(), ["sleepy".to_string()]);
    }

    #[tokio::test]
    async fn test_rpc_disabled_has_no_endpoint() {
        let mut config = server_config("srv");
        config.rpc.enabled = false;
        let server = start_server_with(config, ServerHooks::default()).await;

        let result = RpcClient::connect(RpcClientOptions::new(server.addr())).await;
        assert!(result.is_err());
    }
}
