//! Host and worker driven against each other over in-memory pipes: the
//! handshake, initialize, the getProjects round trips in both directions
//! and shutdown, with fake and with live worker services.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quill_sync::directory::{
    CredentialProvider, DirectoryCache, DirectoryError, DraftStatus, ProjectDescriptor,
    ProjectDirectory, StaticToken,
};
use quill_sync::realtime::{DocServer, DocServerConfig};
use quill_sync::{
    BridgeConfig, ControlPlaneServer, ExitCode, HostController, HostOptions, InitializeParams,
    LiveServices, ServiceError, Worker, WorkerHandle, WorkerOptions, WorkerServices, WorkerState,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const TOKEN: &str = "host-token";

struct HostDirectory;

#[async_trait]
impl ProjectDirectory for HostDirectory {
    async fn list_projects(&self) -> Result<Vec<ProjectDescriptor>, DirectoryError> {
        Ok(["alpha", "beta"]
            .into_iter()
            .map(|id| ProjectDescriptor {
                id: id.to_string(),
                name: id.to_uppercase(),
                short_name: id[..1].to_string(),
                draft_status: DraftStatus::Completed,
            })
            .collect())
    }
}

#[derive(Default)]
struct RecordingServices {
    params: Mutex<Option<InitializeParams>>,
}

#[async_trait]
impl WorkerServices for RecordingServices {
    async fn connect_control_plane(&self, _port: u16) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn connect_backend(&self, params: &InitializeParams) -> Result<(), ServiceError> {
        *self.params.lock().unwrap() = Some(params.clone());
        Ok(())
    }

    async fn register_capabilities(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn list_projects(&self) -> Vec<String> {
        vec!["worker-doc".to_string()]
    }
}

struct Pair {
    host: HostController,
    worker: WorkerHandle,
    worker_task: JoinHandle<(ExitCode, String)>,
}

fn host_options(control_plane_port: u16, ws_base_url: &str) -> HostOptions {
    HostOptions {
        control_plane_port,
        ws_base_url: ws_base_url.to_string(),
        http_base_url: "http://127.0.0.1:1/api".to_string(),
        ..HostOptions::default()
    }
}

/// Wire a host controller and a worker together over two duplex pipes.
fn connect_pair(
    services: Arc<dyn WorkerServices>,
    options: HostOptions,
    worker_options: WorkerOptions,
) -> Pair {
    let (host_out, worker_in) = tokio::io::duplex(16 * 1024);
    let (worker_out, host_in) = tokio::io::duplex(16 * 1024);

    let (tx, _writer) = quill_sync::ipc::spawn_writer(worker_out);
    let worker = Worker::new(services, worker_options, tx);
    let handle = worker.handle();
    let worker_task = tokio::spawn(worker.run(worker_in, std::future::pending()));

    let directory = Arc::new(DirectoryCache::new(Arc::new(HostDirectory), Duration::from_secs(60)));
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticToken::new(TOKEN));
    let host = HostController::start(host_in, host_out, directory, credentials, options);

    Pair {
        host,
        worker: handle,
        worker_task,
    }
}

async fn ready(worker: &WorkerHandle) {
    timeout(Duration::from_secs(5), worker.wait_for_state(WorkerState::Ready))
        .await
        .expect("worker ready in time");
}

#[tokio::test]
async fn test_handshake_then_initialize_carries_credentials() {
    let services = Arc::new(RecordingServices::default());
    let pair = connect_pair(
        services.clone(),
        host_options(4242, "ws://backend.test"),
        WorkerOptions::default(),
    );

    assert!(pair.host.wait_handshake(Duration::from_secs(5)).await);
    ready(&pair.worker).await;
    assert!(pair.worker.handshake().is_complete());
    assert!(pair.host.is_initialized());

    let params = services.params.lock().unwrap().clone().expect("initialize reached the worker");
    assert_eq!(params.auth_token, TOKEN);
    assert_eq!(params.control_plane_port, 4242);
    assert_eq!(params.ws_base_url, "ws://backend.test");
}

#[tokio::test]
async fn test_get_projects_flows_both_ways() {
    let pair = connect_pair(
        Arc::new(RecordingServices::default()),
        host_options(1, "ws://backend.test"),
        WorkerOptions::default(),
    );
    ready(&pair.worker).await;

    let (host_view, again) = tokio::join!(pair.host.get_projects(), pair.host.get_projects());
    assert_eq!(host_view, Ok(vec!["worker-doc".to_string()]));
    assert_eq!(again, host_view);

    let worker_view = pair.worker.request_projects().await;
    assert_eq!(worker_view, Ok(vec!["alpha".to_string(), "beta".to_string()]));
}

#[tokio::test]
async fn test_host_shutdown_ends_worker_gracefully() {
    let pair = connect_pair(
        Arc::new(RecordingServices::default()),
        host_options(1, "ws://backend.test"),
        WorkerOptions::default(),
    );
    ready(&pair.worker).await;

    assert_eq!(pair.host.shutdown("host closing"), Ok(true));
    let (code, reason) = timeout(Duration::from_secs(5), pair.worker_task)
        .await
        .expect("worker stops")
        .unwrap();
    assert_eq!(code, ExitCode::Graceful);
    assert_eq!(reason, "host closing");
    assert_eq!(pair.worker.state(), WorkerState::Terminated);
}

fn live_config(ws_base_url: &str) -> BridgeConfig {
    BridgeConfig {
        ws_base_url: ws_base_url.to_string(),
        http_base_url: "http://127.0.0.1:1/api".to_string(),
        connect_timeout: Duration::from_secs(2),
        subscribe_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..BridgeConfig::default()
    }
}

#[tokio::test]
async fn test_unreachable_backend_exits_with_backend_code() {
    let control = ControlPlaneServer::bind(0, Duration::from_secs(2)).await.unwrap();
    let config = live_config("ws://127.0.0.1:1");
    let pair = connect_pair(
        Arc::new(LiveServices::new(config.clone())),
        host_options(control.port(), &config.ws_base_url),
        WorkerOptions::from(&config),
    );

    let (code, reason) = timeout(Duration::from_secs(10), pair.worker_task)
        .await
        .expect("worker gives up")
        .unwrap();
    assert_eq!(code, ExitCode::BackendUnreachable, "{reason}");
    assert!(!control.is_registered());
}

#[tokio::test]
async fn test_unreachable_control_plane_exits_with_its_own_code() {
    // Bind and drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = live_config("ws://127.0.0.1:1");
    let pair = connect_pair(
        Arc::new(LiveServices::new(config.clone())),
        host_options(port, &config.ws_base_url),
        WorkerOptions::from(&config),
    );

    let (code, _) = timeout(Duration::from_secs(10), pair.worker_task)
        .await
        .expect("worker gives up")
        .unwrap();
    assert_eq!(code, ExitCode::ControlPlaneUnreachable);
}

#[tokio::test]
async fn test_live_worker_serves_documents_through_control_plane() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    let backend = Arc::new(DocServer::new(DocServerConfig {
        auth_token: Some(TOKEN.to_string()),
        ..DocServerConfig::default()
    }));
    let alpha = json!({
        "name": "Alpha",
        "shortName": "A",
        "texts": [{"bookNum": 40, "chapters": [{"number": 1}]}],
    });
    backend.seed("projects", "alpha", alpha).await;
    let serving = backend.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    let control = ControlPlaneServer::bind(0, Duration::from_secs(2)).await.unwrap();
    let config = live_config(&ws_url);
    let pair = connect_pair(
        Arc::new(LiveServices::new(config.clone())),
        host_options(control.port(), &ws_url),
        WorkerOptions::from(&config),
    );
    ready(&pair.worker).await;

    let capabilities = control.wait_registered(Duration::from_secs(2)).await.unwrap();
    assert!(capabilities.iter().any(|c| c == "getChapter"));

    let project = control
        .invoke("getProject", json!({"projectId": "alpha"}))
        .await
        .unwrap();
    assert_eq!(project["version"], 1);
    assert_eq!(project["data"]["name"], "Alpha");

    let submitted = control
        .invoke(
            "submitChange",
            json!({
                "projectId": "alpha",
                "book": 40,
                "chapter": 1,
                "patch": {"verses": {"1": "The book"}},
            }),
        )
        .await
        .unwrap();
    assert_eq!(submitted["version"], 1);
    let (version, stored) = backend.document("texts", "alpha:40:1:target").await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(stored["verses"]["1"], "The book");

    let missing = control
        .invoke("getChapter", json!({"projectId": "alpha", "book": 40, "chapter": 9}))
        .await;
    assert!(missing.is_err());

    // The REST directory is unreachable here, so the listing is degraded.
    let listing = control.invoke("listProjects", json!({})).await.unwrap();
    assert_eq!(listing["degraded"], true);
    assert_eq!(pair.host.get_projects().await, Ok(Vec::<String>::new()));
}
