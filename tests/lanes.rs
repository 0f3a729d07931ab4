//! Lanes running real handlers against an in-process fake queue server.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::path::Path as FsPath;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use osbuild_worker::WorkerConfig;
use osbuild_worker::WorkerEnv;
use osbuild_worker::config::ContainersConfig;
use osbuild_worker::config::KojiServerConfig;
use osbuild_worker::env::CachePaths;
use osbuild_worker::handler::JobContext;
use osbuild_worker::handler::TypedHandler;
use osbuild_worker::handlers::container_resolve::ContainerResolveHandler;
use osbuild_worker::handlers::depsolve::DepsolveHandler;
use osbuild_worker::handlers::koji_finalize::KojiFinalizeHandler;
use osbuild_worker::handlers::osbuild::OsbuildHandler;
use osbuild_worker::handlers::ostree_resolve::OstreeResolveHandler;
use osbuild_worker::protector::NoProtection;
use osbuild_worker::protector::Protector;
use osbuild_worker::protector::Timeouts;
use osbuild_worker::registry::Registry;
use osbuild_worker::runtime::lane::ClaimBackoff;
use osbuild_worker::runtime::lane::LaneWorker;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::JobKind;
use osbuild_worker_api::Lane;
use osbuild_worker_api::jobs::FileResolveJobResult;
use osbuild_worker_client::Client;
use osbuild_worker_client::ClientConfig;
use osbuild_worker_client::Endpoint;
use osbuild_worker_client::RetryPolicy;
use osbuild_worker_koji::upload::adler32_hex;
use osbuild_worker_koji::xmlrpc;
use osbuild_worker_koji::xmlrpc::Value as XmlValue;
use parking_lot::Mutex;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct Queue {
    pending: VecDeque<Value>,
    dependencies: HashMap<Uuid, Vec<Value>>,
    finished: Vec<(Uuid, Value)>,
    koji_calls: Vec<String>,
    koji_uploads: Vec<String>,
    canceled: HashSet<Uuid>,
    claims: usize,
    claim_delay: Option<Duration>,
}

#[derive(Clone, Default)]
struct Fake {
    queue: Arc<Mutex<Queue>>,
}

impl Fake {
    fn offer(&self, kind: JobKind, args: Value, dependencies: Vec<Value>) -> Uuid {
        let id = Uuid::new_v4();
        let dependency_ids: Vec<Uuid> = dependencies.iter().map(|_| Uuid::new_v4()).collect();
        let mut queue = self.queue.lock();
        queue.pending.push_back(json!({
            "id": id,
            "type": kind.as_str(),
            "args": args,
            "dependencies": dependency_ids,
        }));
        queue.dependencies.insert(id, dependencies);
        id
    }

    fn finished(&self) -> Vec<(Uuid, Value)> {
        self.queue.lock().finished.clone()
    }

    fn koji_calls(&self) -> Vec<String> {
        self.queue.lock().koji_calls.clone()
    }

    fn koji_uploads(&self) -> Vec<String> {
        self.queue.lock().koji_uploads.clone()
    }

    fn cancel(&self, id: Uuid) {
        self.queue.lock().canceled.insert(id);
    }

    fn claims(&self) -> usize {
        self.queue.lock().claims
    }
}

/// Hands out the next job, committing it before the optional reply delay.
async fn claim(State(fake): State<Fake>) -> Response {
    let (job, delay) = {
        let mut queue = fake.queue.lock();
        queue.claims += 1;
        (queue.pending.pop_front(), queue.claim_delay)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    match job {
        Some(job) => (StatusCode::CREATED, Json(job)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn status(State(fake): State<Fake>, Path(id): Path<Uuid>) -> Json<Value> {
    let canceled = fake.queue.lock().canceled.contains(&id);
    Json(json!({"canceled": canceled}))
}

async fn finish(State(fake): State<Fake>, Path(id): Path<Uuid>, Json(body): Json<Value>) -> StatusCode {
    fake.queue.lock().finished.push((id, body["result"].clone()));
    StatusCode::OK
}

async fn dependency(State(fake): State<Fake>, Path((id, index)): Path<(Uuid, usize)>) -> Response {
    let queue = fake.queue.lock();
    match queue.dependencies.get(&id).and_then(|deps| deps.get(index)) {
        Some(result) => Json(result.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn kojihub(State(fake): State<Fake>, Query(query): Query<HashMap<String, String>>, body: Bytes) -> String {
    if let Some(filename) = query.get("filename") {
        fake.queue.lock().koji_uploads.push(filename.clone());
        return xmlrpc::encode_response(&XmlValue::structure([
            ("size", XmlValue::Int(body.len() as i64)),
            ("hexdigest", XmlValue::from(adler32_hex(&body))),
        ]));
    }

    let (method, _params) = xmlrpc::decode_call(std::str::from_utf8(&body).unwrap()).unwrap();
    fake.queue.lock().koji_calls.push(method.clone());
    let reply = match method.as_str() {
        "login" => XmlValue::structure([("session-id", XmlValue::Int(17)), ("session-key", XmlValue::from("key"))]),
        "CGImport" => XmlValue::structure([("build_id", XmlValue::Int(42))]),
        "CGRefundBuild" | "logout" => XmlValue::Nil,
        other => return xmlrpc::encode_fault(1000, &format!("unknown method {other}")),
    };
    xmlrpc::encode_response(&reply)
}

async fn serve(fake: Fake) -> String {
    let router = Router::new()
        .route("/api/worker/v1/jobs", post(claim))
        .route(
            "/api/worker/v1/jobs/{id}",
            get(status).patch(|| async { StatusCode::OK }),
        )
        .route("/api/worker/v1/jobs/{id}/finish", post(finish))
        .route("/api/worker/v1/jobs/{id}/dependencies/{index}", get(dependency))
        .route("/kojihub", post(kojihub))
        .route("/repo/refs/heads/fedora/40/x86_64/iot", get(|| async { "abc123\n" }))
        .route("/repo/refs/heads/missing", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(fake);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base: &str) -> Arc<Client> {
    let mut config = ClientConfig::new(Endpoint::Url { url: base.to_string() });
    config.retry = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    config.heartbeat_interval = Some(Duration::from_millis(20));
    Arc::new(Client::new(config).unwrap())
}

fn env(dir: &FsPath, config: WorkerConfig) -> Arc<WorkerEnv> {
    let paths = CachePaths::new(dir.join("cache"));
    paths.create_all().unwrap();
    Arc::new(WorkerEnv::new(config, paths))
}

fn script(dir: &FsPath, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct RunningLane {
    shutdown: CancellationToken,
    lane_task: JoinHandle<()>,
    protector_task: JoinHandle<()>,
}

impl RunningLane {
    fn start(base: &str, lane: Lane, registry: Registry) -> Self {
        let shutdown = CancellationToken::new();
        let (protector, protector_task) = Protector::spawn(
            Arc::new(NoProtection),
            Timeouts {
                protect: Duration::from_secs(1),
                unprotect: Duration::from_secs(1),
            },
            4,
            shutdown.clone(),
        );
        let backoff = ClaimBackoff {
            idle: Duration::from_millis(10),
            error: Duration::from_millis(10),
        };
        let worker = LaneWorker::new(lane, client(base), Arc::new(registry), protector, "x86_64", backoff);
        let lane_task = tokio::spawn(worker.run(shutdown.clone()));
        Self {
            shutdown,
            lane_task,
            protector_task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.lane_task.await.unwrap();
        self.protector_task.await.unwrap();
    }
}

async fn wait_for(what: &str, done: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run `lane` until the fake saw `expected` finished jobs.
async fn run_lane(fake: &Fake, base: &str, lane: Lane, registry: Registry, expected: usize) -> Vec<(Uuid, Value)> {
    let running = RunningLane::start(base, lane, registry);
    wait_for("finished jobs", || fake.finished().len() >= expected).await;
    running.stop().await;
    fake.finished()
}

struct Panicking;

#[async_trait]
impl TypedHandler for Panicking {
    type Output = FileResolveJobResult;

    async fn execute(&self, _ctx: &JobContext, _result: &mut FileResolveJobResult) -> Result<(), ClientError> {
        panic!("resolver blew up");
    }
}

#[tokio::test]
async fn test_panicking_handler_reports_job_panicked() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let id = fake.offer(JobKind::FileResolve, json!({"urls": []}), Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::FileResolve, Arc::new(Panicking));
    let finished = run_lane(&fake, &base, Lane::Misc, registry, 1).await;

    assert_eq!(finished[0].0, id);
    let error = &finished[0].1["job_error"];
    assert_eq!(error["code"], 37);
    assert_eq!(
        error["reason"],
        "job panicked:\nresolver blew up\n\noriginal error:\nnone"
    );
}

#[tokio::test]
async fn test_koji_finalize_fails_build_after_failed_dependency() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let env = env(dir.path(), koji_config());

    let args = json!({
        "server": format!("{base}/kojihub"),
        "name": "fedora-guest",
        "version": "40",
        "release": "1",
        "koji_directory": "osbuild-cg/osbuild-composer-koji-1",
        "task_id": 7,
        "start_time": 1700000000u64,
    });
    let dependencies = vec![
        json!({"build_id": 42, "token": "tok"}),
        json!({"success": false, "job_error": {"id": 10, "reason": "osbuild build failed"}}),
    ];
    fake.offer(JobKind::KojiFinalize, args, dependencies);

    let mut registry = Registry::new();
    registry.register(JobKind::KojiFinalize, Arc::new(KojiFinalizeHandler::new(env)));
    let finished = run_lane(&fake, &base, Lane::CopyShare, registry, 1).await;

    assert_eq!(finished[0].1["job_error"]["code"], 13);
    let calls = fake.koji_calls();
    assert_eq!(calls.iter().filter(|m| *m == "CGRefundBuild").count(), 1);
    assert!(!calls.iter().any(|m| m == "CGImport"));
}

fn koji_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.koji.insert(
        "127.0.0.1".to_string(),
        KojiServerConfig {
            user: Some("worker".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        },
    );
    config
}

fn depsolve_args() -> Value {
    json!({
        "arch": "x86_64",
        "module_platform_id": "platform:f40",
        "releasever": "40",
        "grouped_package_sets": {
            "os": [{
                "include": ["bash"],
                "repositories": [{"baseurls": ["https://mirror.example/fedora"]}],
            }],
        },
    })
}

#[tokio::test]
async fn test_depsolve_error_kind_maps_to_code() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = WorkerConfig::default();
    config.dnf_json = script(
        dir.path(),
        "dnf-json",
        r#"cat >/dev/null
echo '{"kind": "DepsolveError", "reason": "nothing provides foo"}'
exit 1"#,
    );
    let env = env(dir.path(), config);
    fake.offer(JobKind::Depsolve, depsolve_args(), Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::Depsolve, Arc::new(DepsolveHandler::new(env)));
    let finished = run_lane(&fake, &base, Lane::Depsolve, registry, 1).await;

    let error = &finished[0].1["job_error"];
    assert_eq!(error["code"], 20);
    assert_eq!(error["reason"], "DNF error occurred: DepsolveError");
    assert_eq!(error["details"], "nothing provides foo");
}

#[tokio::test]
async fn test_depsolve_success_reports_packages() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = WorkerConfig::default();
    config.dnf_json = script(
        dir.path(),
        "dnf-json",
        r#"cat >/dev/null
echo '{"solver": "dnf5", "packages": [{"name": "bash", "version": "5.2"}]}'"#,
    );
    let env = env(dir.path(), config);
    fake.offer(JobKind::Depsolve, depsolve_args(), Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::Depsolve, Arc::new(DepsolveHandler::new(env)));
    let finished = run_lane(&fake, &base, Lane::Depsolve, registry, 1).await;

    let result = &finished[0].1;
    assert!(result.get("job_error").is_none());
    assert_eq!(result["solver"], "dnf5");
    assert_eq!(result["package_specs"]["os"][0]["name"], "bash");
}

#[tokio::test]
async fn test_osbuild_stage_failure_names_the_stage() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let osbuild = script(
        dir.path(),
        "osbuild",
        r#"if [ "$1" = "--version" ]; then
  echo "osbuild 130"
  exit 0
fi
cat >/dev/null
echo '{"success": false, "log": {"os": [{"type": "org.osbuild.rpm", "success": false, "output": "boom"}]}}'
exit 1"#,
    );
    let mut env = WorkerEnv::new(WorkerConfig::default(), CachePaths::new(dir.path().join("cache")));
    env.paths.create_all().unwrap();
    env.tools.osbuild = osbuild.display().to_string();

    let args = json!({
        "manifest": {"version": "2", "pipelines": [{"name": "os"}]},
        "targets": [{
            "name": "org.osbuild.worker.server",
            "osbuild_artifact": {"export_filename": "disk.qcow2", "export_name": "image"},
        }],
        "pipeline_names": {"build": [], "payload": ["os"]},
    });
    fake.offer(JobKind::Osbuild, args, Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::Osbuild, Arc::new(OsbuildHandler::new(Arc::new(env))));
    let finished = run_lane(&fake, &base, Lane::Build, registry, 1).await;

    let result = &finished[0].1;
    assert_eq!(result["success"], false);
    assert_eq!(result["osbuild_version"], "130");
    assert_eq!(result["job_error"]["code"], 10);
    assert_eq!(
        result["job_error"]["reason"],
        r#"osbuild build failed in stage: "org.osbuild.rpm""#
    );
}

/// Waits for the queue server to cancel the job, then returns successfully.
#[derive(Default)]
struct WaitsForCancel {
    saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl TypedHandler for WaitsForCancel {
    type Output = FileResolveJobResult;

    async fn execute(&self, ctx: &JobContext, _result: &mut FileResolveJobResult) -> Result<(), ClientError> {
        ctx.canceled().cancelled().await;
        self.saw_cancel.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_canceled_job_is_not_finished() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let id = fake.offer(JobKind::FileResolve, json!({"urls": []}), Vec::new());

    let handler = WaitsForCancel::default();
    let saw_cancel = Arc::clone(&handler.saw_cancel);
    let mut registry = Registry::new();
    registry.register(JobKind::FileResolve, Arc::new(handler));
    let running = RunningLane::start(&base, Lane::Misc, registry);

    wait_for("the job to be claimed", || fake.claims() >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!saw_cancel.load(Ordering::SeqCst));

    fake.cancel(id);
    wait_for("the handler to observe cancellation", || saw_cancel.load(Ordering::SeqCst)).await;
    running.stop().await;

    assert!(fake.finished().is_empty(), "canceled job was finished: {:?}", fake.finished());
}

struct Succeeds;

#[async_trait]
impl TypedHandler for Succeeds {
    type Output = FileResolveJobResult;

    async fn execute(&self, _ctx: &JobContext, _result: &mut FileResolveJobResult) -> Result<(), ClientError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_during_claim_still_runs_the_job() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    fake.queue.lock().claim_delay = Some(Duration::from_millis(300));
    let id = fake.offer(JobKind::FileResolve, json!({"urls": []}), Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::FileResolve, Arc::new(Succeeds));
    let running = RunningLane::start(&base, Lane::Misc, registry);

    wait_for("the claim to reach the server", || fake.claims() >= 1).await;
    running.stop().await;

    let finished = fake.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, id);
    assert!(finished[0].1.get("job_error").is_none());
    assert_eq!(fake.claims(), 1);
}

#[tokio::test]
async fn test_koji_finalize_fails_build_after_koji_init_error() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let env = env(dir.path(), koji_config());

    let args = json!({
        "server": format!("{base}/kojihub"),
        "name": "fedora-guest",
        "version": "40",
        "release": "1",
        "koji_directory": "osbuild-cg/osbuild-composer-koji-1",
        "task_id": 7,
        "start_time": 1700000000u64,
    });
    let dependencies = vec![
        json!({"build_id": 42, "token": "tok", "koji_error": "CGInitBuild timed out"}),
        json!({"success": true, "osbuild_output": {"success": true}}),
    ];
    fake.offer(JobKind::KojiFinalize, args, dependencies);

    let mut registry = Registry::new();
    registry.register(JobKind::KojiFinalize, Arc::new(KojiFinalizeHandler::new(env)));
    let finished = run_lane(&fake, &base, Lane::CopyShare, registry, 1).await;

    assert_eq!(finished[0].1["job_error"]["code"], 13);
    let calls = fake.koji_calls();
    assert_eq!(calls.iter().filter(|m| *m == "CGRefundBuild").count(), 1);
    assert!(!calls.iter().any(|m| m == "CGImport"));
}

#[tokio::test]
async fn test_ostree_resolve_keeps_resolved_specs_on_failure() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let env = env(dir.path(), WorkerConfig::default());

    let repo = format!("{base}/repo");
    let args = json!({
        "ostree_resolve_specs": [
            {"url": repo, "ref": "fedora/40/x86_64/iot"},
            {"url": repo, "ref": "missing"},
        ],
    });
    fake.offer(JobKind::OstreeResolve, args, Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::OstreeResolve, Arc::new(OstreeResolveHandler::new(env)));
    let finished = run_lane(&fake, &base, Lane::Misc, registry, 1).await;

    let result = &finished[0].1;
    assert_eq!(result["job_error"]["code"], 33);
    let specs = result["ostree_resolve_result_specs"].as_array().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0]["ref"], "fedora/40/x86_64/iot");
    assert_eq!(specs[0]["checksum"], "abc123");
}

#[tokio::test]
async fn test_container_resolve_keeps_resolved_specs_on_failure() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let skopeo = script(
        dir.path(),
        "skopeo",
        r#"for a in "$@"; do last="$a"; done
case "$last" in
  docker://registry.example/good*) printf '%s' '{"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"digest":"sha256:cfg"}}' ;;
  *) echo "manifest unknown" >&2; exit 1 ;;
esac"#,
    );
    let paths = CachePaths::new(dir.path().join("cache"));
    paths.create_all().unwrap();
    let mut env = WorkerEnv::new(WorkerConfig::default(), paths);
    env.tools.skopeo = skopeo.display().to_string();

    let args = json!({
        "arch": "x86_64",
        "specs": [
            {"source": "registry.example/good:latest"},
            {"source": "registry.example/bad:latest"},
        ],
    });
    fake.offer(JobKind::ContainerResolve, args, Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::ContainerResolve, Arc::new(ContainerResolveHandler::new(Arc::new(env))));
    let finished = run_lane(&fake, &base, Lane::Misc, registry, 1).await;

    let result = &finished[0].1;
    assert_eq!(result["job_error"]["code"], 30);
    let specs = result["specs"].as_array().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0]["source"], "registry.example/good:latest");
    assert_eq!(specs[0]["image_id"], "sha256:cfg");
}

#[tokio::test]
async fn test_depsolve_requests_sbom_documents() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = WorkerConfig::default();
    config.dnf_json = script(
        dir.path(),
        "dnf-json",
        r#"request=$(cat)
case "$request" in
  *'"sbom":{"type":"spdx"}'*)
    echo '{"solver": "dnf5", "packages": [{"name": "bash"}], "sbom": {"spdxVersion": "SPDX-2.3"}}' ;;
  *)
    echo '{"kind": "InvalidRequest", "reason": "no sbom requested"}'
    exit 1 ;;
esac"#,
    );
    let env = env(dir.path(), config);
    let mut args = depsolve_args();
    args["sbom_type"] = json!("spdx");
    fake.offer(JobKind::Depsolve, args, Vec::new());

    let mut registry = Registry::new();
    registry.register(JobKind::Depsolve, Arc::new(DepsolveHandler::new(env)));
    let finished = run_lane(&fake, &base, Lane::Depsolve, registry, 1).await;

    let result = &finished[0].1;
    assert!(result.get("job_error").is_none(), "{result}");
    assert_eq!(result["sbom_docs"]["os"]["type"], "spdx");
    assert_eq!(result["sbom_docs"]["os"]["document"]["spdxVersion"], "SPDX-2.3");
}

#[tokio::test]
async fn test_koji_target_uploads_sbom_documents() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let osbuild = script(
        dir.path(),
        "osbuild",
        r#"if [ "$1" = "--version" ]; then
  echo "osbuild 130"
  exit 0
fi
while [ $# -gt 0 ]; do
  if [ "$1" = "--output-directory" ]; then out="$2"; fi
  shift
done
cat >/dev/null
mkdir -p "$out/image"
printf 'qcow2' > "$out/image/disk.qcow2"
echo '{"success": true, "log": {}, "metadata": {}}'"#,
    );
    let mut env = WorkerEnv::new(koji_config(), CachePaths::new(dir.path().join("cache")));
    env.paths.create_all().unwrap();
    env.tools.osbuild = osbuild.display().to_string();

    let args = json!({
        "manifest": {"version": "2", "pipelines": [{"name": "build"}, {"name": "os"}]},
        "depsolve_dyn_args_idx": 0,
        "targets": [{
            "name": "org.osbuild.koji",
            "image_name": "disk.qcow2",
            "osbuild_artifact": {"export_filename": "disk.qcow2", "export_name": "image"},
            "options": {"server": format!("{base}/kojihub"), "upload_directory": "osbuild-cg/abc"},
        }],
        "pipeline_names": {"build": ["build"], "payload": ["os"]},
    });
    let depsolved = json!({
        "package_specs": {},
        "sbom_docs": {
            "build": {"type": "spdx", "document": {"name": "build"}},
            "os": {"type": "spdx", "document": {"name": "os"}},
        },
    });
    fake.offer(JobKind::Osbuild, args, vec![depsolved]);

    let mut registry = Registry::new();
    registry.register(JobKind::Osbuild, Arc::new(OsbuildHandler::new(Arc::new(env))));
    let finished = run_lane(&fake, &base, Lane::Build, registry, 1).await;

    let result = &finished[0].1;
    assert!(result.get("job_error").is_none(), "{result}");
    let target = &result["target_results"][0];
    assert!(target.get("target_error").is_none(), "{target}");
    let sboms: Vec<&str> = target["options"]["sbom_docs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|doc| doc["filename"].as_str().unwrap())
        .collect();
    assert_eq!(
        sboms,
        vec!["disk.qcow2.buildroot-build.spdx.json", "disk.qcow2.image-os.spdx.json"]
    );
    let uploads = fake.koji_uploads();
    assert!(uploads.contains(&"disk.qcow2".to_string()));
    assert!(uploads.contains(&"disk.qcow2.image-os.spdx.json".to_string()));
}

#[tokio::test]
async fn test_container_target_pushes_to_default_registry() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let osbuild = script(
        dir.path(),
        "osbuild",
        r#"if [ "$1" = "--version" ]; then
  echo "osbuild 130"
  exit 0
fi
while [ $# -gt 0 ]; do
  if [ "$1" = "--output-directory" ]; then out="$2"; fi
  shift
done
cat >/dev/null
mkdir -p "$out/container"
printf 'oci' > "$out/container/container.tar"
echo '{"success": true, "log": {}, "metadata": {}}'"#,
    );
    let pushed = dir.path().join("pushed");
    let skopeo = script(
        dir.path(),
        "skopeo",
        &format!(
            r#"echo "$@" > {pushed}
while [ $# -gt 0 ]; do
  if [ "$1" = "--digestfile" ]; then printf 'sha256:feed\n' > "$2"; fi
  shift
done"#,
            pushed = pushed.display()
        ),
    );

    let mut config = WorkerConfig::default();
    config.containers = Some(ContainersConfig {
        domain: "registry.example.com".into(),
        path_prefix: "builds".into(),
        tls_verify: false,
        ..Default::default()
    });
    let mut env = WorkerEnv::new(config, CachePaths::new(dir.path().join("cache")));
    env.paths.create_all().unwrap();
    env.tools.osbuild = osbuild.display().to_string();
    env.tools.skopeo = skopeo.display().to_string();

    let args = json!({
        "manifest": {"version": "2", "pipelines": [{"name": "container"}]},
        "targets": [{
            "name": "org.osbuild.container",
            "image_name": "fedora-bootc:40",
            "osbuild_artifact": {"export_filename": "container.tar", "export_name": "container"},
        }],
    });
    fake.offer(JobKind::Osbuild, args, vec![]);

    let mut registry = Registry::new();
    registry.register(JobKind::Osbuild, Arc::new(OsbuildHandler::new(Arc::new(env))));
    let finished = run_lane(&fake, &base, Lane::Build, registry, 1).await;

    let result = &finished[0].1;
    assert!(result.get("job_error").is_none(), "{result}");
    let target = &result["target_results"][0];
    assert!(target.get("target_error").is_none(), "{target}");
    assert_eq!(target["options"]["url"], "registry.example.com/builds/fedora-bootc:40");
    assert_eq!(target["options"]["digest"], "sha256:feed");

    let command = std::fs::read_to_string(&pushed).unwrap();
    assert!(command.contains("--dest-tls-verify=false"), "{command}");
    assert!(command.contains("/container/container.tar docker://registry.example.com/builds/fedora-bootc:40"));
}
