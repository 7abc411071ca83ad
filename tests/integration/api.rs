//! HTTP API integration tests.
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`,
//! backed by a real orchestrator and a scripted runner.

use crate::common::{WAIT, scanme_success};
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use scanward::api::{build_router, create_api_state};
use scanward::testing::ScriptedRunner;
use scanward::{Dispatcher, InMemoryStorage, Orchestrator, OrchestratorHandle, Registry};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApi {
    router: Router,
    orchestrator: OrchestratorHandle,
    runner: Arc<ScriptedRunner>,
}

async fn setup(runner: ScriptedRunner) -> TestApi {
    let runner = Arc::new(runner);
    let storage = Arc::new(InMemoryStorage::new());
    let (orchestrator, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .start()
        .await;
    let dispatcher = Dispatcher::new(Registry::new(storage), orchestrator.clone())
        .with_poll_interval(Duration::from_millis(10))
        .with_wait_timeout(WAIT);
    let state = create_api_state(dispatcher, vec!["-sT".into(), "--top-ports".into(), "100".into()]);
    TestApi {
        router: build_router(state),
        orchestrator,
        runner,
    }
}

impl TestApi {
    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(body)).await
    }

    /// Poll the status endpoint until the scan reports `status`.
    async fn wait_for_status(&self, scan_id: &str, status: &str) -> Value {
        let uri = format!("/api/scans/{}", scan_id);
        let start = tokio::time::Instant::now();
        loop {
            let (code, body) = self.get(&uri).await;
            assert_eq!(code, StatusCode::OK);
            if body["status"] == status {
                return body;
            }
            if start.elapsed() > WAIT {
                panic!("scan {} never reached {}, last: {}", scan_id, status, body["status"]);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Test: The health endpoint reports ok.
#[tokio::test]
async fn test_health() {
    let api = setup(ScriptedRunner::new([])).await;

    let (status, body) = api.get("/api/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

/// Test: Starting a scan returns 202 and the scan later completes with a result.
#[tokio::test]
async fn test_start_poll_and_fetch_result() {
    let api = setup(ScriptedRunner::new([scanme_success()])).await;

    let (status, body) = api
        .post(
            "/api/scans",
            json!({
                "target": "scanme.nmap.org",
                "arguments": ["-sT", "-sV", "--top-ports", "100"],
                "label": "scanme"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "QUEUED");
    let scan_id = body["scan_id"].as_str().unwrap().to_string();
    assert!(scan_id.starts_with("scan-"));

    let described = api.wait_for_status(&scan_id, "COMPLETED").await;
    assert_eq!(described["label"], "scanme");
    assert_eq!(described["target"], "scanme.nmap.org");
    assert_eq!(described["attempts"][0]["outcome"], "succeeded");
    assert!(described["failure"].is_null());

    let (status, body) = api.get(&format!("/api/scans/{}/result", scan_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scan_id"], scan_id.as_str());
    let ports: Vec<u64> = body["result"]["hosts"][0]["ports"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["state"] == "open")
        .map(|p| p["port"].as_u64().unwrap())
        .collect();
    assert_eq!(ports, vec![22, 80]);
    assert!(body["summary"].as_str().unwrap().contains("22/tcp"));
}

/// Test: Asking for a result before completion is a conflict.
#[tokio::test]
async fn test_result_before_completion_is_conflict() {
    let api = setup(ScriptedRunner::new([]).hang_until_cancelled()).await;

    let (_, body) = api
        .post("/api/scans", json!({ "target": "10.0.0.1", "arguments": ["-sT"] }))
        .await;
    let scan_id = body["scan_id"].as_str().unwrap().to_string();
    api.wait_for_status(&scan_id, "RUNNING").await;

    let (status, body) = api.get(&format!("/api/scans/{}/result", scan_id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    api.orchestrator.shutdown().await.unwrap();
}

/// Test: Unknown scan ids are 404 on every per-scan endpoint.
#[tokio::test]
async fn test_unknown_scan_not_found() {
    let api = setup(ScriptedRunner::new([])).await;

    for uri in ["/api/scans/scan-missing", "/api/scans/scan-missing/result"] {
        let (status, body) = api.get(uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }
    let (status, _) = api.post("/api/scans/scan-missing/cancel", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Run-and-wait returns the completed scan with its result.
#[tokio::test]
async fn test_run_returns_final_result() {
    let api = setup(ScriptedRunner::new([scanme_success()])).await;

    let (status, body) = api
        .post("/api/scans/run", json!({ "target": "scanme.nmap.org" }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
    assert!(body["failure"].is_null());
    assert_eq!(body["result"]["hosts"].as_array().unwrap().len(), 1);

    // No arguments in the request means the configured defaults.
    let requests = api.runner.requests().await;
    assert_eq!(requests[0].arguments, vec!["-sT", "--top-ports", "100"]);
}

/// Test: Run-and-wait reports a rejected scan with its failure reason.
#[tokio::test]
async fn test_run_rejected_input_reports_failure() {
    let api = setup(ScriptedRunner::new([scanme_success()])).await;

    let (status, body) = api
        .post(
            "/api/scans/run",
            json!({ "target": "10.0.0.1", "nmap_args": "-sT -iL /etc/passwd" }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["failure"]["kind"], "validation_rejected");
    assert!(body["result"].is_null());
    assert_eq!(api.runner.invocations(), 0);
}

/// Test: A command-line string is split into tokens.
#[tokio::test]
async fn test_argument_string_is_split() {
    let api = setup(ScriptedRunner::new([scanme_success()])).await;

    let (_, body) = api
        .post(
            "/api/scans",
            json!({ "target": "scanme.nmap.org", "nmap_args": "-sV --script 'http-title' -p 22,80" }),
        )
        .await;
    let scan_id = body["scan_id"].as_str().unwrap().to_string();

    let described = api.wait_for_status(&scan_id, "COMPLETED").await;
    assert_eq!(
        described["arguments"],
        json!(["-sV", "--script", "http-title", "-p", "22,80"])
    );
}

/// Test: Scans are listed oldest first and can be filtered by status.
#[tokio::test]
async fn test_list_and_filter() {
    let api = setup(ScriptedRunner::new([]).hang_until_cancelled()).await;

    let mut ids = Vec::new();
    for label in ["first", "second"] {
        let (_, body) = api
            .post(
                "/api/scans",
                json!({ "target": "10.0.0.1", "arguments": ["-sT"], "label": label }),
            )
            .await;
        ids.push(body["scan_id"].as_str().unwrap().to_string());
    }
    let (_, body) = api
        .post("/api/scans", json!({ "target": "10.0.0.1", "arguments": ["-iL", "x"] }))
        .await;
    let rejected = body["scan_id"].as_str().unwrap().to_string();
    api.wait_for_status(&rejected, "FAILED").await;

    let (status, body) = api.get("/api/scans").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
    let listed: Vec<&str> = body["scans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["scan_id"].as_str().unwrap())
        .collect();
    assert_eq!(listed, vec![ids[0].as_str(), ids[1].as_str(), rejected.as_str()]);
    assert_eq!(body["scans"][0]["label"], "first");

    let (_, body) = api.get("/api/scans?status=FAILED").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["scans"][0]["scan_id"], rejected.as_str());

    let (_, body) = api.get("/api/scans?limit=1").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["scans"][0]["scan_id"], ids[0].as_str());

    api.orchestrator.shutdown().await.unwrap();
}

/// Test: Cancelling through the API ends the scan and a repeat reports it finished.
#[tokio::test]
async fn test_cancel_endpoint() {
    let api = setup(ScriptedRunner::new([]).hang_until_cancelled()).await;

    let (_, body) = api
        .post("/api/scans", json!({ "target": "10.0.0.1", "arguments": ["-sT"] }))
        .await;
    let scan_id = body["scan_id"].as_str().unwrap().to_string();
    api.wait_for_status(&scan_id, "RUNNING").await;

    let uri = format!("/api/scans/{}/cancel", scan_id);
    let (status, body) = api.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["message"], format!("scan '{}' cancelled", scan_id));

    let (_, body) = api.get(&format!("/api/scans/{}", scan_id)).await;
    assert_eq!(body["status"], "CANCELLED");

    let (status, body) = api.get(&format!("/api/scans/{}/result", scan_id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("CANCELLED"));

    api.orchestrator.shutdown().await.unwrap();
}

/// Test: Starting a scan after shutdown is refused.
#[tokio::test]
async fn test_start_after_shutdown_unavailable() {
    let api = setup(ScriptedRunner::new([])).await;
    api.orchestrator.shutdown().await.unwrap();

    let (status, body) = api
        .post("/api/scans", json!({ "target": "10.0.0.1", "arguments": ["-sT"] }))
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
}
