//! Integration tests for the HTTP cluster clients
//!
//! Thin axum servers stand in for the cluster API and the per-node link
//! agent, bound to random localhost ports.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use vnetctl::cluster::{
    AgentError, ClusterConnection, HttpLinkAgent, KubeClient, LinkAgent, LinkRequest, UnlinkRequest,
    WorkloadApi, WorkloadError,
};
use vnetctl::config::Settings;
use vnetctl::topology::store::append_link;
use vnetctl::topology::{link_pair, StoreError, TopologyRecord, TopologyStore};

const NS: &str = "lab";

/// Serve `app` on a random port and return its base URL
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let addr = listener.local_addr().expect("Failed to get local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server failed");
    });
    format!("http://{}", addr)
}

fn error_body(status: StatusCode, message: String) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "kind": "Status", "message": message })))
}

// ============================================================================
// Fake cluster API
// ============================================================================

#[derive(Clone, Default)]
struct ApiState {
    records: Arc<Mutex<BTreeMap<String, Value>>>,
    version: Arc<AtomicU64>,
    auth: Arc<Mutex<Vec<String>>>,
}

impl ApiState {
    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn note_auth(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(header::AUTHORIZATION) {
            self.auth
                .lock()
                .unwrap()
                .push(value.to_str().unwrap_or_default().to_string());
        }
    }
}

async fn list_topologies(State(state): State<ApiState>, headers: HeaderMap) -> Json<Value> {
    state.note_auth(&headers);
    let items: Vec<Value> = state.records.lock().unwrap().values().cloned().collect();
    Json(json!({ "apiVersion": "networkop.co.uk/v1beta1", "kind": "TopologyList", "items": items }))
}

async fn create_topology(
    State(state): State<ApiState>,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let name = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
    let mut records = state.records.lock().unwrap();
    if records.contains_key(&name) {
        return error_body(StatusCode::CONFLICT, format!("{} already exists", name));
    }
    body["metadata"]["resourceVersion"] = json!(state.next_version());
    records.insert(name, body.clone());
    (StatusCode::CREATED, Json(body))
}

async fn get_topology(
    State(state): State<ApiState>,
    Path((_ns, name)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    match state.records.lock().unwrap().get(&name) {
        Some(record) => (StatusCode::OK, Json(record.clone())),
        None => error_body(StatusCode::NOT_FOUND, format!("{} not found", name)),
    }
}

async fn patch_topology(
    State(state): State<ApiState>,
    Path((_ns, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/merge-patch+json" {
        return error_body(StatusCode::UNSUPPORTED_MEDIA_TYPE, content_type.to_string());
    }
    let patch: Value = serde_json::from_slice(&body).unwrap();
    let version = state.next_version();
    let mut records = state.records.lock().unwrap();
    let Some(record) = records.get_mut(&name) else {
        return error_body(StatusCode::NOT_FOUND, format!("{} not found", name));
    };
    if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
        if record["metadata"]["resourceVersion"] != expected {
            return error_body(StatusCode::CONFLICT, "the object has been modified".to_string());
        }
    }
    record["spec"]["links"] = patch["spec"]["links"].clone();
    record["metadata"]["resourceVersion"] = json!(version);
    (StatusCode::OK, Json(record.clone()))
}

async fn delete_topology(
    State(state): State<ApiState>,
    Path((_ns, name)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    match state.records.lock().unwrap().remove(&name) {
        Some(_) => (StatusCode::OK, Json(json!({ "status": "Success" }))),
        None => error_body(StatusCode::NOT_FOUND, format!("{} not found", name)),
    }
}

/// Pods named `pending*` have not been scheduled yet and carry no host IP
async fn get_pod(Path((_ns, name)): Path<(String, String)>) -> Json<Value> {
    if name.starts_with("pending") {
        return Json(json!({ "metadata": { "name": name }, "status": { "phase": "Pending" } }));
    }
    Json(json!({
        "metadata": { "name": name },
        "status": {
            "phase": "Running",
            "hostIP": "127.0.0.1",
            "containerStatuses": [{ "name": "pod", "ready": true, "restartCount": 0 }]
        }
    }))
}

async fn delete_pod(Path((_ns, name)): Path<(String, String)>) -> (StatusCode, Json<Value>) {
    error_body(StatusCode::NOT_FOUND, format!("pods \"{}\" not found", name))
}

async fn create_pod(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["metadata"]["name"] == "r1" {
        return error_body(StatusCode::CONFLICT, "pods \"r1\" already exists".to_string());
    }
    (StatusCode::CREATED, Json(body))
}

fn api_router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/apis/networkop.co.uk/v1beta1/namespaces/{ns}/topologies",
            get(list_topologies).post(create_topology),
        )
        .route(
            "/apis/networkop.co.uk/v1beta1/namespaces/{ns}/topologies/{name}",
            get(get_topology).patch(patch_topology).delete(delete_topology),
        )
        .route("/api/v1/namespaces/{ns}/pods", post(create_pod))
        .route("/api/v1/namespaces/{ns}/pods/{name}", get(get_pod).delete(delete_pod))
        .with_state(state)
}

async fn kube_client() -> (ApiState, KubeClient) {
    let state = ApiState::default();
    let url = serve(api_router(state.clone())).await;
    let connection = ClusterConnection::new(url).with_token(Some("s3cret".to_string()));
    (state, KubeClient::new(connection).unwrap())
}

#[tokio::test]
async fn test_store_create_list_and_bearer_token() {
    let (state, kube) = kube_client().await;
    let created = kube.create(NS, &TopologyRecord::new("sw1", vec![])).await.unwrap();
    assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

    let records = kube.list(NS).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name(), "sw1");
    assert_eq!(state.auth.lock().unwrap().as_slice(), ["Bearer s3cret"]);

    let duplicate = kube.create(NS, &TopologyRecord::new("sw1", vec![])).await;
    assert_eq!(duplicate, Err(StoreError::AlreadyExists("sw1".to_string())));
}

#[tokio::test]
async fn test_store_patch_carries_version() {
    let (_state, kube) = kube_client().await;
    kube.create(NS, &TopologyRecord::new("r1", vec![])).await.unwrap();
    let (half, _) = link_pair(1, "r1", "sw1", Some("10.12.1.1/24".parse().unwrap()), None);

    let stale = kube.patch_links(NS, "r1", &[half.clone()], Some("0")).await;
    assert_eq!(stale, Err(StoreError::Conflict("r1".to_string())));

    let updated = append_link(&kube, NS, "r1", half.clone()).await.unwrap();
    assert_eq!(updated.links(), &[half]);
    assert_eq!(updated.metadata.resource_version.as_deref(), Some("3"));

    let fetched = kube.get(NS, "r1").await.unwrap();
    assert_eq!(fetched.links()[0].local_ip.unwrap().to_string(), "10.12.1.1/24");
    assert_eq!(fetched.links()[0].peer_ip, None);
}

#[tokio::test]
async fn test_store_missing_records() {
    let (_state, kube) = kube_client().await;
    assert_eq!(
        kube.get(NS, "host7").await,
        Err(StoreError::NotFound("host7".to_string()))
    );
    assert_eq!(
        kube.delete(NS, "host7").await,
        Err(StoreError::NotFound("host7".to_string()))
    );
}

#[tokio::test]
async fn test_workload_status_and_errors() {
    let (_state, kube) = kube_client().await;
    let status = kube.pod_status(NS, "sw1").await.unwrap();
    assert!(status.is_ready());
    assert_eq!(status.host_ip.as_deref(), Some("127.0.0.1"));

    assert_eq!(
        kube.delete_pod(NS, "sw1").await,
        Err(WorkloadError::NotFound("sw1".to_string()))
    );

    let template = Settings::default().template();
    kube.create_pod(NS, &template.router_pod("r2")).await.unwrap();
    assert_eq!(
        kube.create_pod(NS, &template.router_pod("r1")).await,
        Err(WorkloadError::AlreadyExists("r1".to_string()))
    );
}

#[tokio::test]
async fn test_unreachable_api_server() {
    let kube = KubeClient::new(ClusterConnection::new("http://127.0.0.1:1")).unwrap();
    assert!(matches!(kube.list(NS).await, Err(StoreError::Transport(_))));
}

// ============================================================================
// Fake link agent
// ============================================================================

#[derive(Clone, Default)]
struct AgentState {
    links: Arc<Mutex<Vec<Value>>>,
}

async fn make_link(State(state): State<AgentState>, Json(body): Json<Value>) -> StatusCode {
    state.links.lock().unwrap().push(body);
    StatusCode::OK
}

async fn delete_link(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let iface = body["iface"].as_str().unwrap_or_default().to_string();
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("interface {} not found", iface) })),
    )
}

async fn link_agent() -> (AgentState, HttpLinkAgent) {
    let (_api, kube) = kube_client().await;
    let state = AgentState::default();
    let app = Router::new()
        .route("/v1/links", post(make_link))
        .route("/v1/links/delete", post(delete_link))
        .with_state(state.clone());
    let url = serve(app).await;
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
    (state, HttpLinkAgent::new(Arc::new(kube), port).unwrap())
}

fn link_request(pod_a: &str) -> LinkRequest {
    LinkRequest {
        pod_a: pod_a.to_string(),
        iface_a: format!("{}_sw1", pod_a),
        ip_a: "10.12.1.1/24".to_string(),
        pod_b: "sw1".to_string(),
        iface_b: format!("sw1_{}", pod_a),
        ip_b: String::new(),
        namespace: NS.to_string(),
    }
}

#[tokio::test]
async fn test_agent_found_through_pod_host_ip() {
    let (state, agent) = link_agent().await;
    agent.make_link(&link_request("r1")).await.unwrap();

    let links = state.links.lock().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["pod_a"], "r1");
    assert_eq!(links[0]["iface_b"], "sw1_r1");
    assert_eq!(links[0]["ip_b"], "");
}

#[tokio::test]
async fn test_agent_rejection_carries_message() {
    let (_state, agent) = link_agent().await;
    let request = UnlinkRequest {
        pod: "sw1".to_string(),
        iface: "sw1_r1".to_string(),
        namespace: NS.to_string(),
    };
    let err = agent.delete_link(&request).await.unwrap_err();
    assert_eq!(
        err,
        AgentError::Rejected {
            status: 404,
            message: "interface sw1_r1 not found".to_string()
        }
    );
}

#[tokio::test]
async fn test_agent_needs_scheduled_pod() {
    let (_state, agent) = link_agent().await;
    let err = agent.make_link(&link_request("pending1")).await.unwrap_err();
    assert_eq!(err, AgentError::NoHostIp("pending1".to_string()));
}
