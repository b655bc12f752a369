//! HTTP surface
//!
//! Routes:
//! - `GET /healthz`
//! - `POST /vice/launch` with an [`AnalysisJob`] body
//! - `GET /vice/admission/{username}`
//! - `POST /vice/{external_id}/exit`, `/save-and-exit`,
//!   `/download-input-files`, `/save-output-files` (`?user=` gates on
//!   permissions, `?async=true` detaches transfers)
//! - `GET /vice/{external_id}/resources`
//! - `GET /vice/hosts/{host}/external-id`
//! - `POST /vice/relabel`
//! - `GET /vice/tasks`, `GET /vice/tasks/{id}`, `POST /vice/tasks/{id}/cancel`
//!
//! Errors come back as a Kubernetes-style `Status` object.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::admission::AdmissionDecision;
use crate::job::AnalysisJob;
use crate::labels::ExternalId;
use crate::lifecycle::TeardownReport;
use crate::manager::{AnalysisManager, LaunchOutcome, TransferDispatch};
use crate::tasks::TaskRecord;
use crate::Error;

type AppState = Arc<AnalysisManager>;

/// Build the router over a shared manager
pub fn router(manager: Arc<AnalysisManager>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/vice/launch", post(launch))
        .route("/vice/relabel", post(relabel))
        .route("/vice/tasks", get(list_tasks))
        .route("/vice/tasks/{id}", get(get_task))
        .route("/vice/tasks/{id}/cancel", post(cancel_task))
        .route("/vice/admission/{username}", get(admission))
        .route("/vice/hosts/{host}/external-id", get(host_external_id))
        .route("/vice/{external_id}/exit", post(exit))
        .route("/vice/{external_id}/save-and-exit", post(save_and_exit))
        .route("/vice/{external_id}/download-input-files", post(download_input_files))
        .route("/vice/{external_id}/save-output-files", post(save_output_files))
        .route("/vice/{external_id}/resources", get(resources))
        .with_state(manager)
}

/// Serve until `shutdown` fires.
pub async fn serve(
    manager: Arc<AnalysisManager>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("failed to bind {}: {}", addr, e)))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::internal(format!("http server error: {}", e)))?;
    info!("HTTP server stopped");
    Ok(())
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    kind: &'static str,
    api_version: &'static str,
    status: &'static str,
    reason: &'static str,
    message: String,
    code: u16,
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::Admission(_) => StatusCode::CONFLICT,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Lookup(_) | Error::Http(_) | Error::Staging { .. } => StatusCode::BAD_GATEWAY,
            Error::Kube(kube::Error::Api(ae)) => {
                StatusCode::from_u16(ae.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn reason(code: StatusCode) -> &'static str {
    match code {
        StatusCode::BAD_REQUEST => "BadRequest",
        StatusCode::CONFLICT => "Conflict",
        StatusCode::FORBIDDEN => "Forbidden",
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::BAD_GATEWAY => "BadGateway",
        _ => "InternalError",
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = StatusBody {
            kind: "Status",
            api_version: "v1",
            status: "Failure",
            reason: reason(code),
            message: self.to_string(),
            code: code.as_u16(),
        };
        (code, Json(body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ActorQuery {
    user: Option<String>,
    #[serde(rename = "async", default)]
    detach: bool,
}

#[derive(Serialize)]
struct TaskAccepted {
    task_id: Uuid,
}

#[derive(Serialize)]
struct AdmissionView {
    #[serde(flatten)]
    decision: AdmissionDecision,
    allowed: bool,
}

#[derive(Serialize)]
struct HostView {
    external_id: String,
}

fn external_id(raw: String) -> Result<ExternalId, Error> {
    ExternalId::new(raw)
}

async fn launch(
    State(manager): State<AppState>,
    Json(job): Json<AnalysisJob>,
) -> Result<(StatusCode, Json<LaunchOutcome>), Error> {
    let outcome = manager.launch(&job).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn admission(
    State(manager): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<AdmissionView>, Error> {
    let decision = manager.admission(&username).await?;
    Ok(Json(AdmissionView {
        allowed: decision.allowed(),
        decision,
    }))
}

async fn exit(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<Json<TeardownReport>, Error> {
    let id = external_id(id)?;
    Ok(Json(manager.exit(&id, query.user.as_deref()).await?))
}

async fn save_and_exit(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<(StatusCode, Json<TaskAccepted>), Error> {
    let id = external_id(id)?;
    let task_id = manager.save_and_exit(&id, query.user.as_deref()).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

async fn download_input_files(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<(StatusCode, Json<TransferDispatch>), Error> {
    let id = external_id(id)?;
    let dispatch = manager
        .download_inputs(&id, query.user.as_deref(), query.detach)
        .await?;
    Ok(dispatch_response(dispatch))
}

async fn save_output_files(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<(StatusCode, Json<TransferDispatch>), Error> {
    let id = external_id(id)?;
    let dispatch = manager
        .save_outputs(&id, query.user.as_deref(), query.detach)
        .await?;
    Ok(dispatch_response(dispatch))
}

fn dispatch_response(dispatch: TransferDispatch) -> (StatusCode, Json<TransferDispatch>) {
    let code = match dispatch {
        TransferDispatch::Completed { .. } => StatusCode::OK,
        TransferDispatch::Detached { .. } => StatusCode::ACCEPTED,
    };
    (code, Json(dispatch))
}

async fn resources(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, Error> {
    let id = external_id(id)?;
    let listing = manager.list_resources(&id).await?;
    Ok(Json(
        listing
            .into_iter()
            .map(|(kind, names)| (kind.as_str().to_string(), names))
            .collect(),
    ))
}

async fn host_external_id(
    State(manager): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<HostView>, Error> {
    let id = manager.external_id_for_host(&host).await?;
    Ok(Json(HostView {
        external_id: id.to_string(),
    }))
}

async fn relabel(State(manager): State<AppState>) -> (StatusCode, Json<TaskAccepted>) {
    let task_id = manager.relabel();
    (StatusCode::ACCEPTED, Json(TaskAccepted { task_id }))
}

async fn list_tasks(State(manager): State<AppState>) -> Json<Vec<TaskRecord>> {
    Json(manager.tasks())
}

async fn get_task(
    State(manager): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskRecord>, Error> {
    manager
        .task(&id)
        .map(Json)
        .ok_or_else(|| Error::not_found(format!("task {}", id)))
}

async fn cancel_task(
    State(manager): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<TaskAccepted>), Error> {
    manager.cancel_task(&id)?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id: id })))
}
