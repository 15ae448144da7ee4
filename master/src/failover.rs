use std::collections::HashSet;
use std::time::{Instant, SystemTime};

use common::TaskRef;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::state::AppState;

/// Loop de mantenimiento:
/// - detecta workers muertos (sin heartbeat) y libera sus tareas
/// - mata los jobs que superaron su tiempo de vida
/// - purga jobs terminados hace rato
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(state.config.sweep_interval).await;

        if let Err(e) = sweep_once(&state) {
            warn!("error en failover sweep: {:?}", e);
        }
    }
}

struct DeadWorker {
    worker_id: String,
    hostname: String,
    in_flight: HashSet<TaskRef>,
    host_alive: bool,
}

/// Una pasada de chequeo.
pub fn sweep_once(state: &AppState) -> Result<(), String> {
    let now = SystemTime::now();

    // 1) Detectar qué workers están muertos y quedarse con sus tareas en vuelo
    let mut newly_dead: Vec<DeadWorker> = Vec::new();
    {
        let mut workers = state.workers.lock().map_err(|_| "lock workers")?;

        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: se ignora
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > state.config.worker_timeout {
                meta.dead = true;
                newly_dead.push(DeadWorker {
                    worker_id: worker_id.clone(),
                    hostname: meta.hostname.clone(),
                    in_flight: std::mem::take(&mut meta.in_flight),
                    host_alive: false,
                });
                warn!(
                    worker_id = %worker_id,
                    hostname = %meta.hostname,
                    "marcando worker como DEAD (sin heartbeat hace {:?})",
                    elapsed
                );
            }
        }

        // Otro worker vivo en el mismo host sigue sosteniendo el nodo
        for dead in &mut newly_dead {
            dead.host_alive = workers
                .values()
                .any(|m| !m.dead && m.hostname == dead.hostname);
        }
    }

    // 2) Sus tareas vuelven a la cola sin contar como error
    for dead in &newly_dead {
        let mut released = dead
            .in_flight
            .iter()
            .filter(|task| state.engine.release_task(task, &dead.hostname))
            .count();
        if !dead.host_alive {
            released += state.engine.release_node(&dead.hostname);
        }
        if released > 0 {
            info!(
                worker_id = %dead.worker_id,
                hostname = %dead.hostname,
                released,
                "tareas reencoladas por caída de worker"
            );
        }
    }

    // 3) Tiempo de vida y retención
    let instant = Instant::now();
    let expired = state.engine.expire_jobs(instant);
    if !expired.is_empty() {
        info!(jobs = ?expired, "jobs vencidos");
    }
    let purged = state.engine.purge_finished(instant, state.config.job_retention);
    if purged > 0 {
        info!(purged, "jobs terminados purgados");
    }

    Ok(())
}
