use actix_web::{HttpResponse, Responder, delete, get, post, web};
use serde::{Deserialize, Serialize};

use super::{ErrorResponse, ErrorResponseWithMessage, ServiceContext};
use crate::database;
use crate::job::{BuildStatus, CompileJob, JobKind, JobResult, valid_id};
use crate::notify::BuildEvent;
use crate::oneshot::SubmittedFile;
use crate::parser;
use crate::queue::Enqueue;
use crate::runner::HealthSnapshot;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(post_job_handler)
        .service(get_job_handler)
        .service(delete_job_handler)
        .service(health_handler);
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SubmitRequest {
    pub job_id: String,
    pub owner_scope: String,
    pub triggered_by: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    pub main_file: String,
    pub kind: JobKind,
    /// Inline source files; only meaningful for one-shot jobs
    #[serde(default)]
    pub files: Vec<SubmittedFile>,
}

fn default_engine() -> String {
    "auto".to_string()
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: BuildStatus,
    /// True when a job with this id was already waiting and the submission
    /// was ignored
    pub duplicate: bool,
}

#[post("/jobs")]
pub async fn post_job_handler(
    ctx: web::Data<ServiceContext>,
    body: web::Json<SubmitRequest>,
) -> impl Responder {
    let body = body.into_inner();

    if !valid_id(&body.job_id) || body.main_file.is_empty() {
        return HttpResponse::BadRequest().json(ErrorResponse {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
        });
    }
    if !ctx.engines.knows(&body.engine) {
        return HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: format!("Unknown engine {}.", body.engine),
        });
    }

    let job = CompileJob {
        job_id: body.job_id.clone(),
        owner_scope: body.owner_scope,
        triggered_by: body.triggered_by,
        engine: body.engine,
        main_file: body.main_file,
        kind: body.kind,
    };

    // Create the persistent shadow of the job before it can be claimed
    let queue = match job.kind {
        JobKind::ProjectBuild => {
            if let Err(e) = database::create_build(&ctx.db, &job).await {
                log::error!("Failed to insert build record for {}: {e}", job.job_id);
                return HttpResponse::InternalServerError().json(ErrorResponse {
                    reason: "ERR_EXTERNAL",
                    code: 5,
                });
            }
            &ctx.build_queue
        }
        JobKind::OneShot => {
            if let Err(e) = ctx.oneshot.create(&job, &body.files) {
                log::error!("Failed to materialize one-shot job {}: {e}", job.job_id);
                return HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                    reason: "ERR_INVALID_ARGUMENT",
                    code: 1,
                    message: e.to_string(),
                });
            }
            &ctx.oneshot_queue
        }
    };

    match queue.enqueue(&job).await {
        Ok(Enqueue::Enqueued) => {
            log::info!("Enqueued job {}", job.job_id);
            ctx.notifier.publish(BuildEvent {
                job_id: job.job_id.clone(),
                kind: job.kind,
                status: BuildStatus::Queued,
                result: None,
            });
            HttpResponse::Ok().json(SubmitResponse {
                job_id: job.job_id,
                status: BuildStatus::Queued,
                duplicate: false,
            })
        }
        Ok(Enqueue::Duplicate) => {
            log::debug!("Duplicate submission of job {} ignored", job.job_id);
            HttpResponse::Ok().json(SubmitResponse {
                job_id: job.job_id,
                status: BuildStatus::Queued,
                duplicate: true,
            })
        }
        Err(e) => {
            log::error!("Failed to enqueue job {}: {e}", job.job_id);
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}

#[get("/jobs/{id}")]
pub async fn get_job_handler(
    ctx: web::Data<ServiceContext>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let job_id = path.into_inner().0;

    match database::fetch_build(&ctx.db, &job_id).await {
        Ok(Some(record)) => return HttpResponse::Ok().json(build_result(record)),
        Ok(None) => {}
        Err(e) => {
            log::error!("Failed to fetch build record {job_id}: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            });
        }
    }

    match ctx.oneshot.load(&job_id) {
        Ok(Some(metadata)) => HttpResponse::Ok().json(ctx.oneshot.result(&metadata)),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: format!("Job {job_id} not found."),
        }),
        Err(e) => {
            log::error!("Failed to load one-shot job {job_id}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}

#[delete("/jobs/{id}")]
pub async fn delete_job_handler(
    ctx: web::Data<ServiceContext>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let job_id = path.into_inner().0;
    match ctx.coordinator.request_cancel(&job_id).await {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => {
            log::error!("Failed to process cancellation of job {job_id}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub builds: HealthSnapshot,
    pub oneshot: HealthSnapshot,
}

#[get("/health")]
pub async fn health_handler(ctx: web::Data<ServiceContext>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        builds: ctx.build_runner.health().await,
        oneshot: ctx.oneshot_runner.health().await,
    })
}

/// Assembles the poll payload for a project build from its stored record
fn build_result(record: database::BuildRecord) -> JobResult {
    let entries = parser::parse(&record.logs);
    let warning_count = parser::warning_count(&entries);
    let error_count = parser::error_count(&entries);
    let status = record.parsed_status();
    JobResult {
        job_id: record.id,
        status,
        engine_used: record.engine_used,
        logs: record.logs,
        duration_ms: record.duration_ms,
        exit_code: record.exit_code,
        artifact_path: record.artifact_path,
        errors: entries,
        warning_count,
        error_count,
        expires_at: None,
    }
}
