//! Mock Kubernetes API plumbing for reconciler tests, wired through
//! `tower_test` so assertions happen at the request level.

use std::sync::{Arc, Mutex};

use http::{Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use tower_test::mock::{self, Handle};

/// A single request observed by the mock API server.
#[derive(Debug)]
pub(crate) struct ApiCall {
    pub method: String,
    pub path: String,
    pub body: serde_json::Value,
}

pub(crate) fn mock_client() -> (Client, Handle<Request<Body>, Response<Body>>) {
    let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), handle)
}

/// Answers every request with `respond`, recording calls in arrival order.
/// The server task ends when the client side is dropped.
pub(crate) fn spawn_api<F>(
    mut handle: Handle<Request<Body>, Response<Body>>,
    respond: F,
) -> (tokio::task::JoinHandle<()>, Arc<Mutex<Vec<ApiCall>>>)
where
    F: Fn(&ApiCall) -> Response<Body> + Send + 'static,
{
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();
    let task = tokio::spawn(async move {
        while let Some((request, send)) = handle.next_request().await {
            let (parts, body) = request.into_parts();
            let bytes = body
                .collect()
                .await
                .expect("failed to read request body")
                .to_bytes();
            let call = ApiCall {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                body: serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
            };
            let response = respond(&call);
            recorded.lock().unwrap().push(call);
            send.send_response(response);
        }
    });
    (task, calls)
}

pub(crate) fn json_response(status: u16, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// A Kubernetes `Status` failure response with the given reason.
pub(crate) fn status_response(code: u16, reason: &str) -> Response<Body> {
    json_response(
        code,
        &serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": format!("{} by mock API", reason),
            "reason": reason,
            "code": code,
        }),
    )
}

/// Counts recorded calls whose path matches `fragment`.
pub(crate) fn calls_matching(calls: &Arc<Mutex<Vec<ApiCall>>>, method: &str, fragment: &str) -> usize {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.method == method && c.path.contains(fragment))
        .count()
}

/// Returns the recorded event reasons, in publish order.
pub(crate) fn event_reasons(calls: &Arc<Mutex<Vec<ApiCall>>>) -> Vec<String> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.method == "POST" && c.path.contains("/events"))
        .filter_map(|c| c.body["reason"].as_str().map(|r| r.to_string()))
        .collect()
}
