mod jobs;

pub use jobs::{SubmitRequest, SubmitResponse, configure};

use std::sync::Arc;

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::EngineSet;
use crate::coordinator::CancellationCoordinator;
use crate::notify::StatusBroadcaster;
use crate::oneshot::OneShotStore;
use crate::queue::JobQueue;
use crate::runner::CompileRunner;

/// Shared state handed to every handler
pub struct ServiceContext {
    pub db: SqlitePool,
    pub oneshot: Arc<OneShotStore>,
    pub build_queue: Arc<dyn JobQueue>,
    pub oneshot_queue: Arc<dyn JobQueue>,
    pub coordinator: CancellationCoordinator,
    pub build_runner: Arc<CompileRunner>,
    pub oneshot_runner: Arc<CompileRunner>,
    pub engines: Arc<EngineSet>,
    pub notifier: StatusBroadcaster,
}

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}
