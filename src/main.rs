use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use texd::config::{CliArgs, DataDirs};
use texd::coordinator::CancellationCoordinator;
use texd::database as db;
use texd::heartbeat::HeartbeatPublisher;
use texd::notify::StatusBroadcaster;
use texd::oneshot::{self, OneShotStore};
use texd::queue::{JobQueue, MemoryQueue, RedisQueue};
use texd::recovery;
use texd::routes::ServiceContext;
use texd::runner::{ActiveJobs, CompileRunner, RunnerContext};
use texd::sandbox::create_sandbox;
use texd::shared::{MemoryStore, RedisStore, SharedStore};
use texd::web_server::build_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().expect("Failed to load configuration");
    let dirs = DataDirs::resolve(&config.paths).expect("Failed to prepare data directories");

    let db_path = db::get_db_path();
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path)
        .await
        .expect("Failed to initialize database");

    let oneshot_store = Arc::new(OneShotStore::new(
        dirs.oneshot_root.clone(),
        Duration::from_secs(config.retention.oneshot_ttl_secs),
    ));

    // Shared backends: Redis when configured, otherwise in-process
    let (build_queue, oneshot_queue, store): (
        Arc<dyn JobQueue>,
        Arc<dyn JobQueue>,
        Arc<dyn SharedStore>,
    ) = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let client = redis::Client::open(url.as_str()).expect("Invalid REDIS_URL");
            let conn = client
                .get_connection_manager()
                .await
                .expect("Failed to connect to Redis");
            log::info!("Using Redis backend");
            (
                Arc::new(RedisQueue::new(conn.clone(), "texd:builds")) as Arc<dyn JobQueue>,
                Arc::new(RedisQueue::new(conn.clone(), "texd:oneshot")) as Arc<dyn JobQueue>,
                Arc::new(RedisStore::new(conn)) as Arc<dyn SharedStore>,
            )
        }
        Err(_) => {
            log::warn!("REDIS_URL not set, queue and cancellation state stay in-process");
            (
                Arc::new(MemoryQueue::new()) as Arc<dyn JobQueue>,
                Arc::new(MemoryQueue::new()) as Arc<dyn JobQueue>,
                Arc::new(MemoryStore::new()) as Arc<dyn SharedStore>,
            )
        }
    };

    // Jobs abandoned by a previous process are closed out before any worker starts
    recovery::sweep_on_boot(
        &db_pool,
        &oneshot_store,
        Duration::from_secs(config.retention.stale_build_secs),
    )
    .await
    .expect("Boot sweep failed");

    let sandbox = create_sandbox(&config.sandbox.image).await;
    let notifier = StatusBroadcaster::new(256);
    let active = Arc::new(ActiveJobs::new());
    let engines = Arc::new(config.engines.clone());

    let runner_ctx = |queue: Arc<dyn JobQueue>| RunnerContext {
        queue,
        store: store.clone(),
        sandbox: sandbox.clone(),
        db: db_pool.clone(),
        oneshot: oneshot_store.clone(),
        notifier: notifier.clone(),
        active: active.clone(),
        dirs: dirs.clone(),
        limits: config.limits.clone(),
        engines: engines.clone(),
    };
    let build_runner = CompileRunner::new(
        "build",
        config.limits.max_concurrent_builds as u32,
        runner_ctx(build_queue.clone()),
    );
    let oneshot_runner = CompileRunner::new(
        "oneshot",
        config.limits.max_concurrent_oneshot as u32,
        runner_ctx(oneshot_queue.clone()),
    );

    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    build_runner.spawn_workers(&mut workers, shutdown_token.clone());
    oneshot_runner.spawn_workers(&mut workers, shutdown_token.clone());

    let heartbeat = HeartbeatPublisher::new(
        store.clone(),
        Duration::from_secs(config.retention.heartbeat_interval_secs),
    );
    log::info!("Runner instance id: {}", heartbeat.instance_id());
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_token.clone()));

    let sweep_task = tokio::spawn(oneshot::run_expiry_sweep(
        oneshot_store.clone(),
        Duration::from_secs(config.retention.sweep_interval_secs),
        shutdown_token.clone(),
    ));

    let coordinator = CancellationCoordinator::new(
        vec![build_queue.clone(), oneshot_queue.clone()],
        active.clone(),
        store.clone(),
        db_pool.clone(),
        oneshot_store.clone(),
        notifier.clone(),
    );

    let ctx = web::Data::new(ServiceContext {
        db: db_pool,
        oneshot: oneshot_store,
        build_queue,
        oneshot_queue,
        coordinator,
        build_runner,
        oneshot_runner,
        engines,
        notifier,
    });

    let server = build_server(&config.server, ctx).expect("Failed to build server");
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    // 4. Let the heartbeat publisher retire its record, then stop the sweep
    if let Err(e) = heartbeat_task.await {
        log::error!("Heartbeat task failed: {:?}", e);
    }
    sweep_task.abort();

    log::info!("Shutdown complete");
    Ok(())
}
