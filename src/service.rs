//! HTTP surface: upload an APK, get the patched and signed APK back. Also
//! decompile-only and smali-assemble endpoints sharing the same job slots.

use crate::{
    config::Config,
    error::PatchError,
    job::{JobId, JobOutcome, JobStage},
    pipeline::Pipeline,
    probe::probe_apk,
    resources,
    sign::Signer,
    transform::Transformer,
    util::{now_rfc3339, sha256_hex},
};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const APK_MIME: &str = "application/vnd.android.package-archive";

pub struct AppState<T: Transformer, S: Signer> {
    pipeline: Arc<Pipeline<T, S>>,
    permits: Arc<Semaphore>,
    cfg: Arc<Config>,
}

impl<T: Transformer, S: Signer> Clone for AppState<T, S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            permits: Arc::clone(&self.permits),
            cfg: Arc::clone(&self.cfg),
        }
    }
}

impl<T: Transformer, S: Signer> AppState<T, S> {
    pub fn new(cfg: &Config, pipeline: Pipeline<T, S>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(cfg.limits.max_concurrent_jobs.max(1))),
            cfg: Arc::new(cfg.clone()),
        }
    }

    fn active_jobs(&self) -> usize {
        self.cfg
            .limits
            .max_concurrent_jobs
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }
}

pub fn router<T, S>(state: AppState<T, S>) -> Router
where
    T: Transformer + 'static,
    S: Signer + 'static,
{
    let max_upload = state.cfg.server.max_upload_bytes;
    Router::new()
        .route("/", get(|| async { "APK patch service is running\n" }))
        .route("/health", get(health::<T, S>))
        .route("/toolcheck", get(toolcheck::<T, S>))
        .route("/workspaces", get(workspaces::<T, S>))
        .route("/resources", get(resource_check::<T, S>))
        .route("/patch", post(patch::<T, S>))
        .route("/decompile", post(decompile::<T, S>))
        .route("/assemble", post(assemble::<T, S>))
        .layer(DefaultBodyLimit::max(max_upload))
        .with_state(state)
}

pub async fn bind(cfg: &Config) -> Result<TcpListener> {
    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", cfg.server.bind))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Serves on an already bound listener until ctrl-c.
pub async fn serve<T, S>(listener: TcpListener, state: AppState<T, S>) -> Result<()>
where
    T: Transformer + 'static,
    S: Signer + 'static,
{
    let addr = listener.local_addr().context("listener address")?;
    info!(addr = %addr, max_jobs = state.cfg.limits.max_concurrent_jobs, "patch service listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {e}");
            }
            info!("shutdown requested");
        })
        .await
        .context("server error")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<JobStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
}

/// A failed request: the error plus the job context, if a job was started.
#[derive(Debug)]
pub struct ApiError {
    error: PatchError,
    stage: Option<JobStage>,
    job_id: Option<JobId>,
}

impl ApiError {
    fn for_job(error: PatchError, job_id: JobId) -> Self {
        Self {
            error,
            stage: None,
            job_id: Some(job_id),
        }
    }
}

impl From<PatchError> for ApiError {
    fn from(error: PatchError) -> Self {
        Self {
            error,
            stage: None,
            job_id: None,
        }
    }
}

/// HTTP status for each failure kind. Input problems the caller can fix are
/// 4xx; tool, signing and capacity problems are 5xx.
pub fn status_for(error: &PatchError) -> StatusCode {
    match error {
        PatchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PatchError::EntryPointNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PatchError::TransformFailed { .. } if error.is_client_error() => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PatchError::Busy | PatchError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        PatchError::TransformTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PatchError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        PatchError::TransformFailed { .. }
        | PatchError::InjectionTargetMissing(_)
        | PatchError::SigningFailed(_)
        | PatchError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        // Filesystem and signing errors carry server paths; keep them in the log only.
        let message = match &self.error {
            PatchError::Io { .. } => "internal error".to_string(),
            PatchError::SigningFailed(_) => "signing failed".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: message,
            kind: self.error.kind(),
            stage: self.stage,
            job_id: self.job_id.map(|id| id.to_string()),
        };
        let mut response = (status, Json(body)).into_response();
        if matches!(self.error, PatchError::Busy) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}

async fn health<T: Transformer, S: Signer>(State(state): State<AppState<T, S>>) -> Response {
    Json(serde_json::json!({
        "status": "OK",
        "server_time": now_rfc3339(),
        "active_jobs": state.active_jobs(),
    }))
    .into_response()
}

async fn toolcheck<T, S>(State(state): State<AppState<T, S>>) -> Response
where
    T: Transformer + 'static,
    S: Signer + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    let diag = tokio::task::spawn_blocking(move || {
        let mut tools = vec![pipeline.transformer().doctor()];
        tools.extend(pipeline.signer().doctor());
        tools
    })
    .await;
    match diag {
        Ok(tools) => {
            let (status, label) = if tools.iter().all(|t| t.ok) {
                (StatusCode::OK, "OK")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "ERROR")
            };
            (
                status,
                Json(serde_json::json!({ "status": label, "tools": tools })),
            )
                .into_response()
        }
        Err(e) => {
            error!("toolcheck task failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "toolcheck failed").into_response()
        }
    }
}

async fn workspaces<T: Transformer, S: Signer>(State(state): State<AppState<T, S>>) -> Response {
    match state.pipeline.workspaces().list_active() {
        Ok(entries) => Json(serde_json::json!({ "status": "OK", "workspaces": entries })).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn resource_check<T: Transformer, S: Signer>(State(state): State<AppState<T, S>>) -> Response {
    let root = state.pipeline.workspaces().root().to_path_buf();
    match tokio::task::spawn_blocking(move || resources::collect(&root)).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!("resource check failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "resource check failed").into_response()
        }
    }
}

async fn patch<T, S>(State(state): State<AppState<T, S>>, request: Request) -> Result<Response, ApiError>
where
    T: Transformer + 'static,
    S: Signer + 'static,
{
    let permit = admit(&state).await?;
    let upload = read_upload(&state, request, Upload::Apk).await?;
    let probe = probe_apk(&upload, state.cfg.server.max_upload_bytes)?;
    info!(bytes = probe.file_bytes, dex = probe.dex_files.len(), "upload accepted");

    let job_id = JobId::new();
    let run = run_blocking(&state, permit, job_id, move |pipeline, cancel| {
        pipeline.run_job(job_id, &upload, cancel)
    })
    .await?;

    match run.outcome {
        JobOutcome::Done(apk) => Ok(attachment(
            APK_MIME,
            &state.cfg.server.output_filename,
            job_id,
            apk.bytes,
        )),
        JobOutcome::Failed(failure) => Err(ApiError {
            error: failure.error,
            stage: Some(failure.stage),
            job_id: Some(job_id),
        }),
    }
}

async fn decompile<T, S>(State(state): State<AppState<T, S>>, request: Request) -> Result<Response, ApiError>
where
    T: Transformer + 'static,
    S: Signer + 'static,
{
    let permit = admit(&state).await?;
    let upload = read_upload(&state, request, Upload::Apk).await?;
    probe_apk(&upload, state.cfg.server.max_upload_bytes)?;

    let job_id = JobId::new();
    let zipped = run_blocking(&state, permit, job_id, move |pipeline, cancel| {
        pipeline.run_decompile(job_id, &upload, cancel)
    })
    .await?
    .map_err(|error| ApiError::for_job(error, job_id))?;
    Ok(attachment("application/zip", "smali_out.zip", job_id, zipped))
}

async fn assemble<T, S>(State(state): State<AppState<T, S>>, request: Request) -> Result<Response, ApiError>
where
    T: Transformer + 'static,
    S: Signer + 'static,
{
    let permit = admit(&state).await?;
    let upload = read_upload(&state, request, Upload::SmaliZip).await?;
    if upload.is_empty() {
        return Err(PatchError::InvalidInput("empty upload".into()).into());
    }

    let job_id = JobId::new();
    let dex = run_blocking(&state, permit, job_id, move |pipeline, cancel| {
        pipeline.run_assemble(job_id, &upload, cancel)
    })
    .await?
    .map_err(|error| ApiError::for_job(error, job_id))?;
    Ok(attachment("application/octet-stream", "classes.dex", job_id, dex))
}

/// Runs `work` on the blocking pool while holding `permit`. Dropping the
/// returned future (client disconnect) cancels the job.
async fn run_blocking<T, S, R, F>(
    state: &AppState<T, S>,
    permit: OwnedSemaphorePermit,
    job_id: JobId,
    work: F,
) -> Result<R, ApiError>
where
    T: Transformer + 'static,
    S: Signer + 'static,
    R: Send + 'static,
    F: FnOnce(&Pipeline<T, S>, &CancellationToken) -> R + Send + 'static,
{
    let cancel = CancellationToken::new();
    let disconnect_guard = cancel.clone().drop_guard();

    let pipeline = Arc::clone(&state.pipeline);
    let job_cancel = cancel.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        work(&pipeline, &job_cancel)
    })
    .await;
    disconnect_guard.disarm();

    joined.map_err(|e| {
        error!(%job_id, "job task failed: {e}");
        ApiError::for_job(
            PatchError::io("job task", std::io::Error::other(e.to_string())),
            job_id,
        )
    })
}

fn attachment(content_type: &'static str, filename: &str, job_id: JobId, bytes: Vec<u8>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(v) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }
    if let Ok(v) = HeaderValue::from_str(&job_id.to_string()) {
        headers.insert("x-job-id", v);
    }
    if let Ok(v) = HeaderValue::from_str(&sha256_hex(&bytes)) {
        headers.insert("x-output-sha256", v);
    }
    (StatusCode::OK, headers, bytes).into_response()
}

#[derive(Debug, Clone, Copy)]
enum Upload {
    /// Multipart file field named `*.apk`.
    Apk,
    /// Multipart field `smali` or a file named `*.zip`.
    SmaliZip,
}

impl Upload {
    fn accepts(self, field: Option<&str>, file_name: Option<&str>) -> bool {
        let file_name = file_name.map(str::to_ascii_lowercase);
        match self {
            Self::Apk => file_name.is_some_and(|n| n.ends_with(".apk")),
            Self::SmaliZip => field == Some("smali") || file_name.is_some_and(|n| n.ends_with(".zip")),
        }
    }

    fn missing(self) -> &'static str {
        match self {
            Self::Apk => "no file ending with .apk was found",
            Self::SmaliZip => "'smali' field is required",
        }
    }
}

/// Raw body, or the first multipart field `kind` accepts.
async fn read_upload<T, S>(state: &AppState<T, S>, request: Request, kind: Upload) -> Result<Bytes, ApiError>
where
    T: Transformer + 'static,
    S: Signer + 'static,
{
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if !is_multipart {
        return Bytes::from_request(request, state)
            .await
            .map_err(|e| PatchError::InvalidInput(format!("reading body: {e}")).into());
    }

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| PatchError::InvalidInput(format!("multipart: {e}")))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PatchError::InvalidInput(format!("multipart: {e}")))?
    {
        if !kind.accepts(field.name(), field.file_name()) {
            continue;
        }
        let field_name = field.name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| PatchError::InvalidInput(format!("multipart: {e}")))?;
        info!(field = %field_name, ?kind, "found upload field");
        return Ok(bytes);
    }
    Err(PatchError::InvalidInput(kind.missing().into()).into())
}

/// Takes a job slot. Runs before any of the body is read.
async fn admit<T: Transformer, S: Signer>(state: &AppState<T, S>) -> Result<OwnedSemaphorePermit, ApiError> {
    let wait = state.cfg.limits.queue_wait_seconds;
    let permits = Arc::clone(&state.permits);
    let permit = if wait == 0 {
        permits.try_acquire_owned().ok()
    } else {
        tokio::time::timeout(Duration::from_secs(wait), permits.acquire_owned())
            .await
            .ok()
            .and_then(Result::ok)
    };
    permit.ok_or_else(|| {
        warn!(active = state.active_jobs(), "rejecting upload: concurrency limit reached");
        PatchError::Busy.into()
    })
}
