use super::*;
use crate::routes::RouteTable;
use hyper::header::HeaderMap;
use hyper::Uri;
use serde_json::json;
use weft_common::HttpMethod;

const WAIT: Duration = Duration::from_secs(10);

fn dispatcher() -> Dispatcher {
    Dispatcher::spawn(
        RouteTable::shared(),
        &DatabaseConfig::InMemory,
        Recorder::disabled(),
    )
    .unwrap()
}

fn request(method: HttpMethod, uri: &str) -> RequestView {
    let uri: Uri = uri.parse().unwrap();
    RequestView::from_parts(method, &uri, &HeaderMap::new(), b"", None)
}

/// Match the way the HTTP layer does: against the shared table, outside the
/// worker.
fn matched(dispatcher: &Dispatcher, method: HttpMethod, uri: &str) -> (RouteTarget, RequestView) {
    let found = dispatcher.routes().read().unwrap().find(method, uri).unwrap();
    (found.target, request(method, uri).with_params(found.params))
}

async fn script(dispatcher: &Dispatcher, source: &str) -> ExecutionResult {
    dispatcher.run_script(source, Origin::Api, WAIT).await.unwrap()
}

#[tokio::test]
async fn test_fifo_order_under_sequential_submission() {
    let dispatcher = dispatcher();
    script(&dispatcher, "state.order = []").await;

    let tickets: Vec<JobTicket> = (0..50)
        .map(|i| {
            dispatcher
                .submit(JobKind::RawScript {
                    source: format!("state.order.push({})", i),
                    origin: Origin::Api,
                })
                .unwrap()
        })
        .collect();

    for ticket in tickets {
        assert!(ticket.wait(WAIT).await.unwrap().is_success());
    }

    let state = dispatcher.read_state(WAIT).await.unwrap();
    let expected: Vec<i64> = (0..50).collect();
    assert_eq!(state["order"], json!(expected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_serialized() {
    let dispatcher = dispatcher();
    script(&dispatcher, "state.counter = 0").await;

    let mut handles = Vec::new();
    for _ in 0..100 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let source = "var current = state.counter; state.counter = current + 1;";
            dispatcher
                .run_script(source, Origin::Api, WAIT)
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    let state = dispatcher.read_state(WAIT).await.unwrap();
    assert_eq!(state["counter"], json!(100));

    let stats = dispatcher.stats();
    assert_eq!(stats.failed, 0);
    assert!(stats.completed >= 102);
}

#[tokio::test]
async fn test_failing_job_leaves_state_and_routes_intact() {
    let dispatcher = dispatcher();
    script(&dispatcher, "state.kept = 'yes'; weft.get('/alive', () => 'ok');").await;

    let failed = script(&dispatcher, "state.kept = 'partial'; throw new Error('kaboom')").await;
    assert!(failed.error.unwrap().contains("kaboom"));

    // Writes made before the throw stay: there is no rollback.
    let state = dispatcher.read_state(WAIT).await.unwrap();
    assert_eq!(state["kept"], json!("partial"));

    let (target, view) = matched(&dispatcher, HttpMethod::Get, "/alive");
    let invocation = dispatcher.invoke(target, view, WAIT).await.unwrap();
    assert_eq!(invocation.result.value, json!("ok"));
    assert_eq!(dispatcher.stats().failed, 1);
}

#[tokio::test]
async fn test_route_overwrite_second_handler_wins() {
    let dispatcher = dispatcher();
    script(&dispatcher, "weft.get('/x', (req, res) => res.send('one'))").await;
    script(&dispatcher, "weft.get('/x', (req, res) => res.send('two'))").await;

    assert_eq!(dispatcher.routes().read().unwrap().len(), 1);
    let (target, view) = matched(&dispatcher, HttpMethod::Get, "/x");
    let invocation = dispatcher.invoke(target, view, WAIT).await.unwrap();
    assert_eq!(invocation.reply.body.as_ref(), b"two");
}

#[tokio::test]
async fn test_replaced_handler_is_rematched_in_worker() {
    let dispatcher = dispatcher();
    script(&dispatcher, "weft.get('/v/:n', (req, res) => res.send('old ' + req.params.n))").await;
    let (stale, view) = matched(&dispatcher, HttpMethod::Get, "/v/1");

    script(&dispatcher, "weft.get('/v/:n', (req, res) => res.send('new ' + req.params.n))").await;

    let invocation = dispatcher.invoke(stale, view, WAIT).await.unwrap();
    assert_eq!(invocation.reply.body.as_ref(), b"new 1");
}

#[tokio::test]
async fn test_cleared_route_answers_404() {
    let dispatcher = dispatcher();
    script(&dispatcher, "weft.get('/soon-gone', () => 1)").await;
    let (target, view) = matched(&dispatcher, HttpMethod::Get, "/soon-gone");

    assert_eq!(dispatcher.reset_routes(WAIT).await.unwrap(), 1);

    let invocation = dispatcher.invoke(target, view, WAIT).await.unwrap();
    assert_eq!(invocation.reply.status, 404);
    assert!(dispatcher.routes().read().unwrap().is_empty());
}

#[tokio::test]
async fn test_double_send_delivers_one_body() {
    let dispatcher = dispatcher();
    let source = "weft.post('/twice', (req, res) => { res.json({ n: 1 }); res.json({ n: 2 }); })";
    script(&dispatcher, source).await;

    let (target, view) = matched(&dispatcher, HttpMethod::Post, "/twice");
    let invocation = dispatcher.invoke(target, view, WAIT).await.unwrap();
    assert!(invocation.result.is_success());
    assert_eq!(invocation.reply.body.as_ref(), br#"{"n":1}"#);
}

#[tokio::test]
async fn test_timeout_abandons_wait_but_job_still_runs() {
    let dispatcher = dispatcher();

    dispatcher
        .submit_detached(JobKind::RawScript {
            source: "var until = Date.now() + 300; while (Date.now() < until) {}".to_string(),
            origin: Origin::Api,
        })
        .unwrap();

    let waited = dispatcher
        .run_script("state.touched = true", Origin::Api, Duration::from_millis(20))
        .await;
    assert!(matches!(waited, Err(WeftError::Timeout(20))));

    let state = dispatcher.read_state(WAIT).await.unwrap();
    assert_eq!(state["touched"], json!(true));

    let stats = dispatcher.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.undelivered, 1);
}

#[tokio::test]
async fn test_state_replace_through_jobs() {
    let dispatcher = dispatcher();
    script(&dispatcher, "state.old = 1").await;

    dispatcher.replace_state(json!({"new": 2}), WAIT).await.unwrap();
    assert_eq!(dispatcher.read_state(WAIT).await.unwrap(), json!({"new": 2}));

    let rejected = dispatcher.replace_state(json!([1]), WAIT).await;
    assert!(matches!(rejected, Err(WeftError::InvalidState(_))));
    assert_eq!(dispatcher.read_state(WAIT).await.unwrap(), json!({"new": 2}));
}

#[tokio::test]
async fn test_detached_script_clears_pending_session() {
    let dispatcher = dispatcher();
    let session = dispatcher
        .submit_detached(JobKind::RawScript {
            source: "state.detached = true".to_string(),
            origin: Origin::Api,
        })
        .unwrap();

    // The read is queued behind the detached script.
    let state = dispatcher.read_state(WAIT).await.unwrap();
    assert_eq!(state["detached"], json!(true));
    assert!(!dispatcher.pending().contains(&session));
}

#[tokio::test]
async fn test_tickets_carry_distinct_sessions() {
    let dispatcher = dispatcher();
    let a = dispatcher.submit(JobKind::ReadState).unwrap();
    let b = dispatcher.submit(JobKind::ReadState).unwrap();
    assert_ne!(a.session_id(), b.session_id());
    assert!(b.id() > a.id());
    assert!(matches!(a.wait(WAIT).await.unwrap(), JobOutcome::State(_)));
    assert!(matches!(b.wait(WAIT).await.unwrap(), JobOutcome::State(_)));
}

#[test]
fn test_spawn_fails_for_unopenable_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("nested").join("weft.db");
    let result = Dispatcher::spawn(
        RouteTable::shared(),
        &DatabaseConfig::File(path),
        Recorder::disabled(),
    );
    assert!(matches!(result, Err(WeftError::Database(_))));
}
