use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use serde_json::json;
use tempfile::TempDir;

use texd::config::{DataDirs, EngineSet, LimitsConfig, PathsConfig};
use texd::coordinator::CancellationCoordinator;
use texd::database;
use texd::job::JobResult;
use texd::notify::StatusBroadcaster;
use texd::oneshot::OneShotStore;
use texd::queue::{JobQueue, MemoryQueue};
use texd::routes::{self, ServiceContext, SubmitResponse, json_error_handler};
use texd::runner::{ActiveJobs, CompileRunner, RunnerContext};
use texd::sandbox::ProcessSandbox;
use texd::shared::{MemoryStore, SharedStore};

/// Route-level fixture: full service context over the in-process backends,
/// with no workers running so queued jobs stay queued.
async fn service_context(root: &TempDir) -> web::Data<ServiceContext> {
    let paths = PathsConfig {
        data_root: Some(root.path().to_path_buf()),
    };
    let dirs = DataDirs::resolve(&paths).expect("Failed to resolve data dirs");
    let db = database::init_db(root.path().join("texd.sqlite3"))
        .await
        .expect("Failed to initialize test database");

    let build_queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new());
    let oneshot_queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new());
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let oneshot = Arc::new(OneShotStore::new(
        dirs.oneshot_root.clone(),
        Duration::from_secs(60),
    ));
    let notifier = StatusBroadcaster::new(64);
    let active = Arc::new(ActiveJobs::new());
    let engines = Arc::new(EngineSet::default());

    let runner_ctx = |queue: Arc<dyn JobQueue>| RunnerContext {
        queue,
        store: store.clone(),
        sandbox: Arc::new(ProcessSandbox::new()),
        db: db.clone(),
        oneshot: oneshot.clone(),
        notifier: notifier.clone(),
        active: active.clone(),
        dirs: dirs.clone(),
        limits: LimitsConfig::default(),
        engines: engines.clone(),
    };
    let build_runner = CompileRunner::new("build", 2, runner_ctx(build_queue.clone()));
    let oneshot_runner = CompileRunner::new("oneshot", 2, runner_ctx(oneshot_queue.clone()));

    let coordinator = CancellationCoordinator::new(
        vec![build_queue.clone(), oneshot_queue.clone()],
        active,
        store,
        db.clone(),
        oneshot.clone(),
        notifier.clone(),
    );

    web::Data::new(ServiceContext {
        db,
        oneshot,
        build_queue,
        oneshot_queue,
        coordinator,
        build_runner,
        oneshot_runner,
        engines,
        notifier,
    })
}

macro_rules! test_app {
    ($ctx:expr) => {
        test::init_service(
            App::new()
                .app_data($ctx.clone())
                .app_data(web::JsonConfig::default().error_handler(json_error_handler))
                .configure(routes::configure),
        )
        .await
    };
}

fn build_submission(job_id: &str) -> serde_json::Value {
    json!({
        "job_id": job_id,
        "owner_scope": "proj1",
        "triggered_by": "alice",
        "engine": "auto",
        "main_file": "main.tex",
        "kind": "project_build",
    })
}

#[actix_web::test]
async fn submission_and_duplicate_are_both_accepted() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx);

    let req = test::TestRequest::post()
        .uri("/jobs")
        .set_json(build_submission("b1"))
        .to_request();
    let resp: SubmitResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp.job_id, "b1");
    assert!(!resp.duplicate);

    let req = test::TestRequest::post()
        .uri("/jobs")
        .set_json(build_submission("b1"))
        .to_request();
    let resp: SubmitResponse = test::call_and_read_body_json(&app, req).await;
    assert!(resp.duplicate);
}

#[actix_web::test]
async fn unknown_engine_is_rejected_before_the_queue() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx.clone());

    let mut body = build_submission("b1");
    body["engine"] = json!("troff");
    let req = test::TestRequest::post()
        .uri("/jobs")
        .set_json(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    assert!(ctx.build_queue.claim().await.unwrap().is_none());
}

#[actix_web::test]
async fn malformed_body_yields_the_error_envelope() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx);

    let req = test::TestRequest::post()
        .uri("/jobs")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["reason"], "ERR_INVALID_ARGUMENT");
}

#[actix_web::test]
async fn queued_job_is_pollable_and_cancelable() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx);

    let req = test::TestRequest::post()
        .uri("/jobs")
        .set_json(build_submission("b2"))
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::get().uri("/jobs/b2").to_request();
    let result: JobResult = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result.status.as_str(), "queued");

    let req = test::TestRequest::delete().uri("/jobs/b2").to_request();
    let outcome: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["was_queued"], true);
    assert_eq!(outcome["was_running"], false);

    let req = test::TestRequest::get().uri("/jobs/b2").to_request();
    let result: JobResult = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result.status.as_str(), "canceled");
}

#[actix_web::test]
async fn cancel_of_an_unknown_job_reports_nothing_to_do() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx);

    let req = test::TestRequest::delete().uri("/jobs/ghost").to_request();
    let outcome: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["was_queued"], false);
    assert_eq!(outcome["was_running"], false);
}

#[actix_web::test]
async fn missing_job_is_a_404() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx);

    let req = test::TestRequest::get().uri("/jobs/ghost").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["reason"], "ERR_NOT_FOUND");
}

#[actix_web::test]
async fn oneshot_submission_materializes_files() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx.clone());

    let body = json!({
        "job_id": "os1",
        "owner_scope": "os1",
        "triggered_by": "api",
        "main_file": "main.tex",
        "kind": "one_shot",
        "files": [
            {"path": "main.tex", "content": "\\documentclass{article}"},
            {"path": "chapters/intro.tex", "content": "hello"}
        ],
    });
    let req = test::TestRequest::post()
        .uri("/jobs")
        .set_json(body)
        .to_request();
    let resp: SubmitResponse = test::call_and_read_body_json(&app, req).await;
    assert!(!resp.duplicate);

    let source_dir = ctx.oneshot.source_dir("os1").unwrap();
    assert!(source_dir.join("main.tex").exists());
    assert!(source_dir.join("chapters/intro.tex").exists());

    let req = test::TestRequest::get().uri("/jobs/os1").to_request();
    let result: JobResult = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result.status.as_str(), "queued");
    assert!(result.expires_at.is_none());
}

#[actix_web::test]
async fn traversal_paths_in_oneshot_files_are_rejected() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx);

    let body = json!({
        "job_id": "os2",
        "owner_scope": "os2",
        "triggered_by": "api",
        "main_file": "main.tex",
        "kind": "one_shot",
        "files": [{"path": "../escape.tex", "content": "x"}],
    });
    let req = test::TestRequest::post()
        .uri("/jobs")
        .set_json(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn health_reports_both_runner_pools() {
    let root = TempDir::new().unwrap();
    let ctx = service_context(&root).await;
    let app = test_app!(ctx);

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["builds"]["max_concurrent"], 2);
    assert_eq!(body["oneshot"]["max_concurrent"], 2);
    assert_eq!(body["builds"]["active_jobs"], 0);
    assert_eq!(body["builds"]["backend_connected"], true);
    assert_eq!(body["builds"]["total_processed"], 0);
}
