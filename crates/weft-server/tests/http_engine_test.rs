//! HTTP Engine Integration Tests
//!
//! Starts a real server on an ephemeral port and drives it with reqwest:
//! - script submission and the admin API
//! - script-registered routes, cookies and redirects
//! - concurrent requests funnelled through the dispatcher
//! - timeouts and request logging

use reqwest::{redirect, Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use weft_server::{Engine, EngineConfig, HttpServer};

struct TestServer {
    base: String,
    engine: Arc<Engine>,
    client: Client,
}

impl TestServer {
    async fn start(config: EngineConfig) -> Self {
        let engine = Arc::new(Engine::new(config).expect("engine"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = HttpServer::new(engine.clone());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            base: format!("http://{}", addr),
            engine,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn execute(&self, script: &str) -> (StatusCode, Value) {
        let res = self
            .client
            .post(self.url("/_api/execute"))
            .body(script.to_string())
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap())
    }
}

// ============================================================================
// Script submission
// ============================================================================

#[tokio::test]
async fn test_execute_envelope_over_http() {
    let server = TestServer::start(EngineConfig::default()).await;

    let (status, body) = server.execute("var greeting = 'hello'; greeting").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["result"], json!("hello"));

    // Top-level declarations persist across submissions.
    let (_, body) = server.execute("greeting + ' again'").await;
    assert_eq!(body["result"], json!("hello again"));

    let (status, body) = server.execute("throw new TypeError('bad input')").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("bad input"));
    assert!(body["sessionID"].is_string());
}

#[tokio::test]
async fn test_timeout_returns_408_and_side_effect_lands() {
    let config = EngineConfig::default().with_response_timeout(Duration::from_millis(50));
    let server = TestServer::start(config).await;

    let (status, body) = server
        .execute(
            "var until = Date.now() + 300; while (Date.now() < until) {} state.slow = 'done'; 1",
        )
        .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["success"], json!(false));

    let mut state = Value::Null;
    for _ in 0..100 {
        state = server
            .client
            .get(server.url("/_api/state"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if state.get("slow").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state["slow"], json!("done"));
}

// ============================================================================
// Script-registered routes
// ============================================================================

#[tokio::test]
async fn test_route_params_query_and_body() {
    let server = TestServer::start(EngineConfig::default()).await;
    server
        .execute(
            r#"
            weft.post('/users/:id/posts/:postId', (req, res) => {
                res.json({ params: req.params, tags: req.query.tag, body: req.body });
            });
            "#,
        )
        .await;

    let body: Value = server
        .client
        .post(server.url("/users/42/posts/7?tag=a&tag=b"))
        .json(&json!({"title": "hi"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["params"], json!({"id": "42", "postId": "7"}));
    assert_eq!(body["tags"], json!(["a", "b"]));
    assert_eq!(body["body"], json!({"title": "hi"}));
}

#[tokio::test]
async fn test_cookies_headers_and_redirect() {
    let server = TestServer::start(EngineConfig::default()).await;
    server
        .execute(
            r#"
            weft.get('/login', (req, res) => {
                res.cookie('sid', 'abc', { httpOnly: true }).set('X-Weft', 'yes').redirect('/home');
            });
            weft.get('/whoami', (req, res) => res.send('sid=' + req.cookies.sid));
            "#,
        )
        .await;

    let res = server.client.get(server.url("/login")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(res.headers()["location"], "/home");
    assert_eq!(res.headers()["x-weft"], "yes");
    assert!(res.headers()["set-cookie"]
        .to_str()
        .unwrap()
        .starts_with("sid=abc"));

    let text = server
        .client
        .get(server.url("/whoami"))
        .header("cookie", "sid=xyz")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "sid=xyz");
}

#[tokio::test]
async fn test_unmatched_route_is_404_envelope() {
    let server = TestServer::start(EngineConfig::default()).await;
    let res = server.client.get(server.url("/missing")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_serialized() {
    let server = Arc::new(TestServer::start(EngineConfig::default()).await);
    server
        .execute(
            r#"
            state.hits = 0;
            weft.post('/hit', () => {
                var seen = state.hits;
                state.hits = seen + 1;
                return state.hits;
            });
            "#,
        )
        .await;

    let mut handles = Vec::new();
    for _ in 0..100 {
        let server = server.clone();
        handles.push(tokio::spawn(async move {
            server
                .client
                .post(server.url("/hit"))
                .send()
                .await
                .unwrap()
                .status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    let (_, body) = server.execute("state.hits").await;
    assert_eq!(body["result"], json!(100));
}

// ============================================================================
// Request logging
// ============================================================================

#[tokio::test]
async fn test_requests_are_logged() {
    let server = TestServer::start(EngineConfig::default()).await;
    server
        .execute("weft.get('/logged', () => { console.log('inside'); return 'ok'; })")
        .await;
    server.client.get(server.url("/logged")).send().await.unwrap();

    let mut found = None;
    for _ in 0..100 {
        found = server
            .engine
            .requests()
            .find(|record| record.path == "/logged");
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = found.expect("request record");
    assert_eq!(record.method, "GET");
    assert_eq!(record.status, 200);
    assert_eq!(record.console[0].message, "inside");
    assert!(record.remote_addr.is_some());
}

#[tokio::test]
async fn test_execute_request_log_carries_job_activity() {
    let server = TestServer::start(EngineConfig::default()).await;
    let (status, _) = server
        .execute("db.exec('CREATE TABLE t (v INTEGER)'); console.log('from-exec'); 1")
        .await;
    assert_eq!(status, StatusCode::OK);

    let mut found = None;
    for _ in 0..100 {
        let records: Vec<Value> = server
            .client
            .get(server.url("/_api/requests?limit=100"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        found = records
            .into_iter()
            .find(|record| record["path"] == json!("/_api/execute"));
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = found.expect("execute request record");
    assert_eq!(record["status"], json!(200));
    assert_eq!(record["console"][0]["message"], json!("from-exec"));
    assert_eq!(record["db_operations"].as_array().map(Vec::len), Some(1));
    assert_eq!(record["db_operations"][0]["sql"], json!("CREATE TABLE t (v INTEGER)"));
}
