//! Shared setup for the scenarios.

use mesh_client::{Client, ClientOptions, RpcClient, RpcClientOptions};
use mesh_server::{Server, ServerConfig, ServerHooks};
use std::time::Duration;

/// Default config for server `id` on an ephemeral port.
pub fn server_config(id: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.id = id.to_string();
    config.port = 0;
    config
}

/// Start a server with `id` on an ephemeral port.
pub async fn start_server(id: &str) -> Server {
    start_server_with(server_config(id), ServerHooks::default()).await
}

pub async fn start_server_with(config: ServerConfig, hooks: ServerHooks) -> Server {
    let (server, listener) = Server::bind(config, hooks)
        .await
        .expect("bind ephemeral port");
    tokio::spawn(server.clone().serve(listener));
    server
}

pub async fn ws_client(server: &Server, id: &str) -> Client {
    ws_client_with(ClientOptions::new(server.addr()).with_id(id)).await
}

pub async fn ws_client_with(options: ClientOptions) -> Client {
    Client::connect(options).await.expect("client connects")
}

pub async fn rpc_client(server: &Server, id: &str) -> RpcClient {
    let options = RpcClientOptions::new(server.addr())
        .with_id(id)
        .poll_interval(Duration::from_millis(20));
    RpcClient::connect(options).await.expect("rpc client registers")
}

/// Poll `check` every 10 ms for up to 2 s.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
