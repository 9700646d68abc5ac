//! Client Integration Tests
//!
//! Runs the client against an in-process Weft server bound to an ephemeral
//! port.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use weft_client::WeftClient;
use weft_common::auth::AuthConfig;
use weft_common::{HttpMethod, WeftError};
use weft_server::{Engine, EngineConfig, HttpServer};

async fn start_server(auth: AuthConfig) -> String {
    let engine = Engine::new(EngineConfig::default()).unwrap().with_auth(auth);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(Arc::new(engine));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_execute_and_state() {
    let client = WeftClient::new(start_server(AuthConfig::disabled()).await).unwrap();

    let envelope = client.execute("state.answer = 42; state.answer").await.unwrap();
    assert!(envelope.success);
    assert_eq!(envelope.result, Some(json!(42)));

    let failed = client.execute("nope.nope").await.unwrap();
    assert!(!failed.success);
    assert!(failed.error.is_some());

    assert_eq!(client.state().await.unwrap(), json!({"answer": 42}));

    client.replace_state(&json!({"fresh": true})).await.unwrap();
    assert_eq!(client.state().await.unwrap(), json!({"fresh": true}));

    let rejected = client.replace_state(&json!("not an object")).await;
    assert!(matches!(rejected, Err(WeftError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_routes_and_reset() {
    let client = WeftClient::new(start_server(AuthConfig::disabled()).await).unwrap();
    client
        .execute("weft.get('/a', () => 1); weft.post('/b/:id', () => 2);")
        .await
        .unwrap();

    let routes = client.routes().await.unwrap();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[1].method, HttpMethod::Post);
    assert_eq!(routes[1].pattern, "/b/:id");

    assert_eq!(client.reset_routes().await.unwrap(), 2);
    assert!(client.routes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_detached_execution_is_pollable() {
    let client = WeftClient::new(start_server(AuthConfig::disabled()).await).unwrap();
    let session = client.execute_detached("'later'").await.unwrap();

    let mut envelope = client.session(session).await.unwrap();
    for _ in 0..100 {
        if !envelope.pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        envelope = client.session(session).await.unwrap();
    }
    assert!(!envelope.pending);
    assert_eq!(envelope.result, Some(json!("later")));
}

#[tokio::test]
async fn test_api_key_is_sent() {
    let base = start_server(AuthConfig::with_api_key("k3y")).await;

    let anonymous = WeftClient::new(base.clone()).unwrap();
    assert!(matches!(anonymous.state().await, Err(WeftError::InvalidRequest(_))));

    let client = WeftClient::new(base).unwrap().with_api_key("k3y");
    assert!(client.health().await.unwrap()["status"] == json!("ok"));
}
