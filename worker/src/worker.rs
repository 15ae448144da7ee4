use anyhow::{Context, Result};
use chrono::Utc;
use common::{
    TaskAssignment, TaskAssignmentRequest, TaskAssignmentResponse, TaskOutcome, TaskReport,
    TaskReportResponse, WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::{sync::Arc, time::Instant};
use std::time::Duration;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::runner;

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos con CPU y memoria.
/// - Pide tareas mientras tenga "slots" libres.
/// - Ejecuta cada tarea en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run(config: WorkerConfig) -> Result<()> {
    let client = Client::new();
    let config = Arc::new(config);

    let mut worker_id = register_until_ok(&client, &config).await;
    let sem = Arc::new(Semaphore::new(config.max_concurrency as usize));

    // System para leer CPU y memoria
    let mut sys = System::new_all();
    let mut last_heartbeat: Option<Instant> = None;

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        if last_heartbeat.map_or(true, |t| t.elapsed() >= config.heartbeat_interval) {
            match heartbeat(&client, &config, &worker_id, &mut sys).await {
                Ok(StatusCode::NOT_FOUND) => {
                    warn!(worker_id = %worker_id, "el master no conoce este worker, re-registrando");
                    worker_id = register_until_ok(&client, &config).await;
                }
                Ok(_) => {}
                Err(e) => warn!("heartbeat falló: {:#}", e),
            }
            last_heartbeat = Some(Instant::now());
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                // No hay capacidad para nuevas tareas; esperamos un poco
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // Pedimos tarea al master
        let res = client
            .post(config.url("/api/v1/tasks/next"))
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await;

        let res = match res {
            Ok(r) => r,
            Err(e) => {
                drop(permit);
                warn!("no pude pedir tarea: {}", e);
                sleep(config.poll_interval).await;
                continue;
            }
        };

        match res.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                drop(permit);
                warn!(worker_id = %worker_id, status = %res.status(), "worker rechazado por el master, re-registrando");
                worker_id = register_until_ok(&client, &config).await;
                continue;
            }
            s if !s.is_success() => {
                drop(permit);
                warn!(status = %s, "el master devolvió error al pedir tarea");
                sleep(config.poll_interval).await;
                continue;
            }
            _ => {}
        }

        let assignment: TaskAssignmentResponse = match res.json().await {
            Ok(a) => a,
            Err(e) => {
                drop(permit);
                warn!("respuesta de asignación ilegible: {}", e);
                sleep(config.poll_interval).await;
                continue;
            }
        };

        if let Some(task) = assignment.task {
            info!(
                task = %task.task,
                job = %task.job_name,
                block = %task.block_name,
                name = %task.name,
                errors = task.errors,
                "tengo tarea"
            );
            tokio::spawn(execute(client.clone(), Arc::clone(&config), task, permit));
        } else {
            // No hay tarea: devolvemos el permiso y dormimos
            drop(permit);
            debug!(worker_id = %worker_id, "pidió tarea pero no hay");
            sleep(config.poll_interval).await;
        }
    }
}

async fn register(client: &Client, config: &WorkerConfig) -> Result<WorkerId> {
    let res = client
        .post(config.url("/api/v1/workers/register"))
        .json(&WorkerRegisterRequest {
            hostname: config.hostname.clone(),
            max_concurrency: config.max_concurrency,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;
    Ok(worker_id)
}

async fn register_until_ok(client: &Client, config: &WorkerConfig) -> WorkerId {
    loop {
        match register(client, config).await {
            Ok(worker_id) => {
                info!(
                    worker_id = %worker_id,
                    hostname = %config.hostname,
                    concurrency = config.max_concurrency,
                    "worker registrado contra {}",
                    config.master_url
                );
                return worker_id;
            }
            Err(e) => {
                warn!("registro falló, reintentando: {:#}", e);
                sleep(config.poll_interval).await;
            }
        }
    }
}

async fn heartbeat(
    client: &Client,
    config: &WorkerConfig,
    worker_id: &str,
    sys: &mut System,
) -> Result<StatusCode> {
    sys.refresh_cpu();
    sys.refresh_memory();

    let res = client
        .post(config.url("/api/v1/workers/heartbeat"))
        .json(&WorkerHeartbeatRequest {
            worker_id: worker_id.to_string(),
            cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
            mem_bytes: Some(sys.used_memory()),
        })
        .send()
        .await
        .context("heartbeat")?;
    Ok(res.status())
}

/// Corre una tarea y reporta `running` y después `done` o `error`.
/// El permiso de concurrencia se libera al terminar.
async fn execute(
    client: Client,
    config: Arc<WorkerConfig>,
    task: TaskAssignment,
    permit: OwnedSemaphorePermit,
) {
    report(&client, &config, &task, TaskOutcome::Running, None).await;

    let (outcome, message) = match runner::run_task(&task).await {
        Ok(res) if res.success => {
            info!(task = %task.task, "terminé tarea correctamente");
            (TaskOutcome::Done, None)
        }
        Ok(res) => {
            warn!(task = %task.task, message = res.message.as_deref().unwrap_or(""), "la tarea falló");
            (TaskOutcome::Error, res.message)
        }
        Err(e) => {
            warn!(task = %task.task, "no se pudo ejecutar la tarea: {:#}", e);
            (TaskOutcome::Error, Some(format!("{:#}", e)))
        }
    };

    report(&client, &config, &task, outcome, message).await;
    drop(permit);
}

async fn report(
    client: &Client,
    config: &WorkerConfig,
    task: &TaskAssignment,
    outcome: TaskOutcome,
    message: Option<String>,
) {
    let body = TaskReport {
        task: task.task.clone(),
        node: config.hostname.clone(),
        outcome,
        timestamp: Utc::now(),
        message,
    };

    let res = client
        .post(config.url("/api/v1/tasks/report"))
        .json(&body)
        .send()
        .await
        .and_then(|r| r.error_for_status());

    match res {
        Ok(r) => match r.json::<TaskReportResponse>().await {
            Ok(ack) => debug!(task = %task.task, ?outcome, ack = ?ack.ack, "reporte enviado"),
            Err(e) => warn!(task = %task.task, "ack ilegible: {}", e),
        },
        Err(e) => warn!(task = %task.task, ?outcome, "no pude reportar: {}", e),
    }
}
