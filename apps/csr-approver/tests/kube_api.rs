use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use csr_approver::kube::{KubeClient, KubeConfig};
use csr_core::{
    ApprovalError, Approver, MalformedEvent, SigningRequest, StoreError, StreamEnd, WatchConfig,
    WatchError, WatchRegistry,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const TOKEN: &str = "test-token";
const COLLECTION: &str = "/apis/certificates.k8s.io/v1/certificatesigningrequests";

#[derive(Clone, Default)]
struct ApiState {
    watch_body: Arc<String>,
    updates: Arc<Mutex<Vec<(String, Value)>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

fn status(code: StatusCode, message: &str) -> Response {
    (
        code,
        Json(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": message,
            "code": code.as_u16()
        })),
    )
        .into_response()
}

async fn watch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return status(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    if query.get("watch").map(String::as_str) != Some("true") {
        return status(StatusCode::BAD_REQUEST, "expected a watch");
    }
    state.watch_body.to_string().into_response()
}

async fn approval(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(mut body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return status(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    state.updates.lock().unwrap().push((name.clone(), body.clone()));
    match name.as_str() {
        "csr-conflict" => status(
            StatusCode::CONFLICT,
            "Operation cannot be fulfilled on certificatesigningrequests.certificates.k8s.io \"csr-conflict\": the object has been modified",
        ),
        "csr-forbidden" => status(
            StatusCode::FORBIDDEN,
            "certificatesigningrequests.certificates.k8s.io \"csr-forbidden\" is forbidden",
        ),
        _ => {
            body["metadata"]["resourceVersion"] = json!("2");
            Json(body).into_response()
        }
    }
}

async fn spawn_api(watch_body: &str) -> (SocketAddr, ApiState) {
    let state = ApiState {
        watch_body: Arc::new(watch_body.to_string()),
        updates: Arc::default(),
    };
    let router = Router::new()
        .route(COLLECTION, get(watch))
        .route(&format!("{COLLECTION}/:name/approval"), put(approval))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind api");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (addr, state)
}

fn csr_json(name: &str) -> Value {
    json!({
        "apiVersion": "certificates.k8s.io/v1",
        "kind": "CertificateSigningRequest",
        "metadata": {"name": name, "resourceVersion": "1", "labels": {"owner": "agent"}},
        "spec": {
            "request": "LS0tLS1CRUdJTiBDRVJUSUZJQ0FURSBSRVFVRVNULS0tLS0K",
            "signerName": "kubernetes.io/kube-apiserver-client",
            "username": "agent",
            "usages": ["client auth"]
        }
    })
}

fn csr(name: &str) -> SigningRequest {
    serde_json::from_value(csr_json(name)).expect("csr")
}

fn watch_line(event_type: &str, object: Value) -> String {
    format!("{}\n", json!({"type": event_type, "object": object}))
}

#[tokio::test]
async fn watch_delivers_requests_and_drops_garbage() {
    let body = [
        watch_line("ADDED", csr_json("csr-1")),
        "this is not json\n".to_string(),
        watch_line(
            "ERROR",
            json!({"kind": "Status", "code": 410, "message": "too old resource version"}),
        ),
        watch_line("MODIFIED", csr_json("csr-2")),
    ]
    .concat();
    let (addr, _state) = spawn_api(&body).await;

    let seen: Arc<Mutex<Vec<MalformedEvent>>> = Arc::default();
    let sink = {
        let seen = seen.clone();
        move |diag: &MalformedEvent| seen.lock().unwrap().push(diag.clone())
    };
    let store = Arc::new(KubeClient::new(format!("http://{addr}"), TOKEN));
    let registry = WatchRegistry::new(store, Arc::new(sink), WatchConfig::default());
    let mut stream = registry.open_watch().await.expect("watch");

    let mut names = Vec::new();
    while let Some(req) = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("watch stalled")
    {
        names.push(req.name().to_string());
    }
    assert_eq!(names, ["csr-1", "csr-2"]);
    assert_eq!(stream.end().await, StreamEnd::Exhausted);
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn rejected_watch_registers_nothing() {
    let (addr, _state) = spawn_api("").await;
    let store = Arc::new(KubeClient::new(format!("http://{addr}"), "wrong-token"));
    let registry = WatchRegistry::new(
        store,
        Arc::new(csr_core::TracingDiagnostics),
        WatchConfig::default(),
    );

    let err = registry.open_watch().await.err().expect("unauthorized");
    match err {
        WatchError::Subscription(StoreError::Api { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "Unauthorized");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(registry.active_sessions(), 0);
}

#[tokio::test]
async fn approve_writes_condition_to_approval_subresource() {
    let (addr, state) = spawn_api("").await;
    let approver = Approver::new(Arc::new(KubeClient::new(format!("http://{addr}/"), TOKEN)));

    let mut req = csr("csr-1");
    let updated = approver.approve(&mut req).await.expect("approve");
    assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));
    assert!(updated.is_approved());

    let updates = state.updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 1);
    let (name, body) = &updates[0];
    assert_eq!(name, "csr-1");
    assert_eq!(body["metadata"]["labels"]["owner"], "agent");
    assert_eq!(body["spec"]["usages"][0], "client auth");
    let conditions = body["status"]["conditions"].as_array().expect("conditions");
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0]["type"], "Approved");
    assert_eq!(conditions[0]["status"], "True");
    assert_eq!(conditions[0]["reason"], "User activation");
    assert_eq!(conditions[0]["message"], "This CSR was approved");
    assert!(conditions[0]["lastUpdateTime"]
        .as_str()
        .is_some_and(|ts| !ts.is_empty()));
}

#[tokio::test]
async fn deny_reports_conflicts_and_rejections() {
    let (addr, state) = spawn_api("").await;
    let approver = Approver::new(Arc::new(KubeClient::new(format!("http://{addr}"), TOKEN)));

    let err = approver
        .deny(&mut csr("csr-conflict"))
        .await
        .expect_err("conflict");
    assert!(matches!(err, ApprovalError::UpdateConflict { ref name } if name == "csr-conflict"));

    let err = approver
        .deny(&mut csr("csr-forbidden"))
        .await
        .expect_err("forbidden");
    match err {
        ApprovalError::Rejected { status, message, .. } => {
            assert_eq!(status, 403);
            assert!(message.contains("forbidden"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let updates = state.updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].1["status"]["conditions"][0]["type"], "Denied");
}

#[tokio::test]
async fn unreachable_api_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let approver = Approver::new(Arc::new(KubeClient::new(format!("http://{addr}"), TOKEN)));
    let err = approver
        .approve(&mut csr("csr-1"))
        .await
        .expect_err("transport");
    assert!(matches!(err, ApprovalError::Transport { .. }));
}

#[tokio::test]
async fn connect_reads_and_trims_token_file() {
    let (addr, _state) = spawn_api(&watch_line("ADDED", csr_json("csr-1"))).await;
    let token_file = std::env::temp_dir().join(format!(
        "csr-approver-token-{}-{}",
        std::process::id(),
        addr.port()
    ));
    std::fs::write(&token_file, format!("{TOKEN}\n")).expect("write token");

    let client = KubeClient::connect(&KubeConfig {
        host: format!("http://{addr}"),
        token_file: token_file.clone(),
        ca_file: None,
        insecure_skip_tls_verify: false,
    })
    .await
    .expect("connect");
    let registry = WatchRegistry::new(
        Arc::new(client),
        Arc::new(csr_core::TracingDiagnostics),
        WatchConfig::default(),
    );
    let mut stream = registry.open_watch().await.expect("watch");
    let req = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("watch stalled")
        .expect("request");
    assert_eq!(req.name(), "csr-1");

    let missing = KubeClient::connect(&KubeConfig {
        host: format!("http://{addr}"),
        token_file: token_file.with_extension("missing"),
        ca_file: None,
        insecure_skip_tls_verify: false,
    })
    .await;
    assert!(missing.is_err());
    let _ = std::fs::remove_file(token_file);
}
