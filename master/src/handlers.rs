use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use common::{
    Job, JobInfo, SubmitResponse, TaskAssignmentRequest, TaskAssignmentResponse, TaskOutcome,
    TaskReport, TaskReportResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use std::sync::{MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};
use std::collections::HashMap;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::state::{AppState, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/pause", post(pause_job))
        .route("/api/v1/jobs/:id/resume", post(resume_job))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/report", post(report_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn workers(state: &AppState) -> MutexGuard<'_, HashMap<String, WorkerMeta>> {
    state.workers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sin token configurado todo pasa; con token se exige `Bearer <token>`.
fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.config.api_token.as_deref() else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Alta de job: valida, materializa tareas y devuelve el id asignado
async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(job): Json<Job>,
) -> (StatusCode, Json<SubmitResponse>) {
    if !authorized(&state, &headers) {
        warn!(name = %job.name, "alta de job rechazada: token inválido");
        let e = DispatchError::Unauthorized;
        return (e.status(), Json(SubmitResponse::rejected(e.to_string())));
    }

    let name = job.name.clone();
    let user = job.user_name.clone();
    match state.engine.submit(job, Instant::now()) {
        Ok(resp) => {
            debug!(name = %name, user = %user, id = ?resp.id, "alta de job");
            (StatusCode::OK, Json(resp))
        }
        Err(e) => {
            warn!(name = %name, user = %user, error = %e, "job rechazado");
            (e.status(), Json(SubmitResponse::rejected(e.to_string())))
        }
    }
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    Json(state.engine.jobs())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, DispatchError> {
    state.engine.job_info(&id).map(Json)
}

async fn pause_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, DispatchError> {
    if !authorized(&state, &headers) {
        warn!(job = %id, "pausa rechazada: token inválido");
        return Err(DispatchError::Unauthorized);
    }
    state.engine.pause(&id).map(Json)
}

async fn resume_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, DispatchError> {
    if !authorized(&state, &headers) {
        warn!(job = %id, "reanudación rechazada: token inválido");
        return Err(DispatchError::Unauthorized);
    }
    state.engine.resume(&id).map(Json)
}

// Registra un worker nuevo y avisa al motor que el nodo está vivo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();
    let max_concurrency = req.max_concurrency.max(1);

    state.engine.node_up(&req.hostname);
    workers(&state).insert(
        worker_id.clone(),
        WorkerMeta::new(req.hostname.clone(), max_concurrency),
    );

    info!(
        worker_id = %worker_id,
        hostname = %req.hostname,
        max_concurrency,
        "worker registrado"
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker; un worker dado por muerto vuelve a la vida
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = workers(&state);
    let meta = workers.get_mut(&req.worker_id).ok_or(StatusCode::NOT_FOUND)?;

    meta.last_heartbeat = SystemTime::now();
    if req.cpu_percent.is_some() {
        meta.last_cpu_percent = req.cpu_percent;
    }
    if req.mem_bytes.is_some() {
        meta.last_mem_bytes = req.mem_bytes;
    }
    if meta.dead {
        meta.dead = false;
        state.engine.node_up(&meta.hostname);
        info!(worker_id = %req.worker_id, hostname = %meta.hostname, "worker revivido");
    }

    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Le pide al motor la siguiente tarea para el nodo del worker, si tiene lugar.
// Los slots se cuentan por worker: dos workers en el mismo host no se pisan.
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, StatusCode> {
    let mut workers = workers(&state);
    let meta = workers.get_mut(&req.worker_id).ok_or(StatusCode::NOT_FOUND)?;
    if meta.dead {
        return Err(StatusCode::GONE);
    }

    let active = meta.in_flight.len() as u32;
    if active >= meta.max_concurrency {
        debug!(
            worker_id = %req.worker_id,
            active,
            max_concurrency = meta.max_concurrency,
            "worker pidió tarea pero está al tope"
        );
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    let task = state.engine.next_task(&meta.hostname, Instant::now());
    if let Some(ref t) = task {
        meta.in_flight.insert(t.task.clone());
        meta.tasks_started += 1;
        info!(
            task = %t.task,
            job = %t.job_name,
            block = %t.block_name,
            worker_id = %req.worker_id,
            hostname = %meta.hostname,
            "asignando tarea ({}/{} en vuelo -> +1)",
            active,
            meta.max_concurrency
        );
    }

    Ok(Json(TaskAssignmentResponse { task }))
}

// Reporte de progreso o resultado de una tarea
async fn report_task(
    State(state): State<AppState>,
    Json(report): Json<TaskReport>,
) -> Result<Json<TaskReportResponse>, DispatchError> {
    let result = state.engine.report(&report, Instant::now());

    // Un reporte final libera el slot del worker aunque el motor lo descarte
    if !matches!(report.outcome, TaskOutcome::Running) {
        let mut workers = workers(&state);
        if let Some(meta) = workers
            .values_mut()
            .find(|m| m.in_flight.contains(&report.task))
        {
            meta.in_flight.remove(&report.task);
            match report.outcome {
                TaskOutcome::Done => meta.tasks_succeeded += 1,
                TaskOutcome::Error => meta.tasks_failed += 1,
                TaskOutcome::Running => {}
            }
        }
    }

    let ack = result?;
    Ok(Json(TaskReportResponse { ack }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    let snapshot: Vec<(String, WorkerMeta)> = workers(&state)
        .iter()
        .map(|(id, meta)| (id.clone(), meta.clone()))
        .collect();

    let mut out: Vec<WorkerMetrics> = snapshot
        .into_iter()
        .map(|(worker_id, meta)| WorkerMetrics {
            active_tasks: meta.in_flight.len() as u32,
            last_heartbeat_secs_ago: now
                .duration_since(meta.last_heartbeat)
                .unwrap_or_default()
                .as_secs(),
            worker_id,
            hostname: meta.hostname,
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            tasks_started: meta.tasks_started,
            tasks_succeeded: meta.tasks_succeeded,
            tasks_failed: meta.tasks_failed,
            cpu_percent: meta.last_cpu_percent,
            mem_bytes: meta.last_mem_bytes,
        })
        .collect();
    out.sort_by(|a, b| a.hostname.cmp(&b.hostname));

    Json(out)
}
