//! Motor de despacho: decide qué tarea se le da a qué nodo y qué pasa cuando
//! una tarea falla.
//!
//! Cada tarea tiene su propio mutex y la asignación es una transición
//! `Pending -> Assigned` hecha con ese mutex tomado, así que una tarea nunca
//! queda en dos workers a la vez. Los contadores de errores por
//! (nodo, bloque) viven en [`HostErrors`]. El tiempo se recibe como
//! parámetro (`now`) en todas las decisiones.
//!
//! Desempate entre varias tareas elegibles: gana la que lleva más tiempo
//! pendiente, según un número de secuencia global que se estampa cada vez
//! que una tarea entra (o vuelve) a `Pending`.

mod host_errors;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use common::{
    ErrorPolicy, HostFilter, Job, JobId, JobInfo, JobState, Mask, ReportAck, SubmitResponse,
    TaskAssignment, TaskCounts, TaskOutcome, TaskRef, TaskReport, TaskState, TaskUnit,
};

use crate::error::DispatchError;
pub use host_errors::{ErrorKey, HostErrors};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct TaskRuntime {
    state: TaskState,
    node: Option<String>,
    errors: u32,
    failed_on: HashSet<String>,
    pending_seq: u64,
}

#[derive(Debug)]
struct TaskSlot {
    unit: TaskUnit,
    runtime: Mutex<TaskRuntime>,
}

#[derive(Debug)]
struct BlockRuntime {
    name: String,
    service: String,
    policy: ErrorPolicy,
    step: i64,
    hosts: HostFilter,
    tasks: Vec<TaskSlot>,
}

impl BlockRuntime {
    fn forgive_window(&self) -> Option<Duration> {
        match self.policy.forgive_time_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug)]
struct JobRuntime {
    id: JobId,
    seq: u64,
    definition: Job,
    depend: Option<Mask>,
    time_life: Duration,
    accepted_at: Instant,
    submitted_at: DateTime<Utc>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    /// Momento en que el job llegó a un estado terminal.
    finished: Mutex<Option<(Instant, DateTime<Utc>)>>,
    paused: AtomicBool,
    killed: AtomicBool,
    errors: AtomicU32,
    blocks: Vec<BlockRuntime>,
}

impl JobRuntime {
    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn counts(&self) -> TaskCounts {
        let mut c = TaskCounts::default();
        for slot in self.blocks.iter().flat_map(|b| b.tasks.iter()) {
            c.total += 1;
            match lock(&slot.runtime).state {
                TaskState::Pending => c.pending += 1,
                TaskState::Assigned => c.assigned += 1,
                TaskState::Running => c.running += 1,
                TaskState::Done => c.done += 1,
                TaskState::Dead => c.dead += 1,
            }
        }
        c
    }

    fn state_from(&self, c: &TaskCounts) -> JobState {
        if self.is_killed() {
            return JobState::Dead;
        }
        if c.done == c.total {
            JobState::Done
        } else if c.done + c.dead == c.total {
            JobState::Dead
        } else if c.assigned + c.running + c.done + c.dead > 0
            || self.errors.load(Ordering::SeqCst) > 0
        {
            JobState::Running
        } else {
            JobState::Pending
        }
    }

    fn state(&self) -> JobState {
        self.state_from(&self.counts())
    }

    fn info(&self) -> JobInfo {
        let tasks = self.counts();
        JobInfo {
            id: self.id.clone(),
            name: self.definition.name.clone(),
            state: self.state_from(&tasks),
            paused: self.is_paused(),
            user_name: self.definition.user_name.clone(),
            annotation: self.definition.annotation.clone(),
            time_life_secs: self.time_life.as_secs(),
            submitted_at: self.submitted_at,
            started_at: *lock(&self.started_at),
            finished_at: lock(&self.finished).map(|(_, at)| at),
            tasks,
            errors: self.errors.load(Ordering::SeqCst),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.accepted_at) > self.time_life
    }

    fn mark_finished_if_terminal(&self, now: Instant) {
        let state = self.state();
        if !state.is_terminal() {
            return;
        }
        let mut finished = lock(&self.finished);
        if finished.is_none() {
            *finished = Some((now, Utc::now()));
            info!(job_id = %self.id, name = %self.definition.name, %state, "job terminado");
        }
    }
}

struct Candidate {
    job: Arc<JobRuntime>,
    block: usize,
    task: usize,
    seq: u64,
}

/// Nodo conocido por el motor; sólo importa si está vivo.
#[derive(Debug, Clone, Copy)]
struct NodeLink {
    alive: bool,
}

/// Motor de políticas de despacho del controlador.
#[derive(Debug, Default)]
pub struct DispatchEngine {
    /// Jobs en orden de envío.
    jobs: RwLock<Vec<Arc<JobRuntime>>>,
    index: DashMap<JobId, Arc<JobRuntime>>,
    host_errors: HostErrors,
    nodes: DashMap<String, NodeLink>,
    submit_seq: AtomicU64,
    pending_seq: AtomicU64,
}

impl DispatchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_pending_seq(&self) -> u64 {
        self.pending_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Arc<JobRuntime>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn job(&self, id: &str) -> Result<Arc<JobRuntime>, DispatchError> {
        self.index
            .get(id)
            .map(|j| Arc::clone(j.value()))
            .ok_or_else(|| DispatchError::JobNotFound(id.to_string()))
    }

    /* ---------------- alta de jobs ---------------- */

    /// Acepta un job: lo valida, materializa sus tareas y le asigna id.
    pub fn submit(&self, job: Job, now: Instant) -> Result<SubmitResponse, DispatchError> {
        job.validate()?;

        let job_hosts = HostFilter::compile(&job.hosts_mask, &job.hosts_mask_exclude)?;
        let depend = Mask::parse_field("depend_mask_global", &job.depend_mask_global)?;
        let time_life_secs = job.resolved_time_life_secs();

        let mut blocks = Vec::with_capacity(job.blocks.len());
        for block in &job.blocks {
            let include = match &block.hosts_mask {
                Some(mask) => Mask::parse_field("block hosts_mask", mask)?,
                None => None,
            };
            let tasks = block
                .task_units()
                .into_iter()
                .map(|unit| TaskSlot {
                    unit,
                    runtime: Mutex::new(TaskRuntime {
                        state: TaskState::Pending,
                        node: None,
                        errors: 0,
                        failed_on: HashSet::new(),
                        pending_seq: self.next_pending_seq(),
                    }),
                })
                .collect();
            blocks.push(BlockRuntime {
                name: block.name.clone(),
                service: block.service.clone(),
                policy: block.error_policy,
                step: block.numeric.map(|n| n.step()).unwrap_or(1),
                hosts: job_hosts.with_include(include),
                tasks,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let total_tasks: usize = blocks.iter().map(|b| b.tasks.len()).sum();
        let paused = job.paused;

        let runtime = Arc::new(JobRuntime {
            id: id.clone(),
            seq: self.submit_seq.fetch_add(1, Ordering::SeqCst),
            depend,
            time_life: Duration::from_secs(time_life_secs),
            accepted_at: now,
            submitted_at: Utc::now(),
            started_at: Mutex::new(None),
            finished: Mutex::new(None),
            paused: AtomicBool::new(paused),
            killed: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            blocks,
            definition: job,
        });

        info!(
            job_id = %id,
            name = %runtime.definition.name,
            blocks = runtime.blocks.len(),
            tasks = total_tasks,
            time_life_secs,
            paused,
            "job aceptado"
        );

        {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            self.index.insert(id.clone(), Arc::clone(&runtime));
            jobs.push(runtime);
        }

        let mut resolved = BTreeMap::new();
        resolved.insert("time_life_secs".to_string(), time_life_secs.into());
        resolved.insert("tasks".to_string(), total_tasks.into());
        resolved.insert("paused".to_string(), paused.into());
        Ok(SubmitResponse::accepted(id, resolved))
    }

    /* ---------------- nodos ---------------- */

    /// Un nodo se registró o volvió a mandar heartbeat.
    pub fn node_up(&self, node: &str) {
        self.nodes.insert(node.to_string(), NodeLink { alive: true });
    }

    /// Un nodo se perdió: sus tareas en vuelo vuelven a la cola sin contar
    /// como error. Devuelve cuántas tareas se liberaron.
    pub fn release_node(&self, node: &str) -> usize {
        self.nodes.insert(node.to_string(), NodeLink { alive: false });

        let mut released = 0;
        for job in self.snapshot() {
            for slot in job.blocks.iter().flat_map(|b| b.tasks.iter()) {
                let mut rt = lock(&slot.runtime);
                if rt.state.is_active() && rt.node.as_deref() == Some(node) {
                    rt.state = TaskState::Pending;
                    rt.node = None;
                    rt.pending_seq = self.next_pending_seq();
                    released += 1;
                }
            }
        }
        if released > 0 {
            warn!(node, released, "nodo perdido, tareas devueltas a la cola");
        }
        released
    }

    /// Devuelve una tarea puntual a la cola sin contar error: el worker que
    /// la tenía se perdió pero el nodo sigue vivo. `false` si la tarea ya no
    /// estaba en ese nodo.
    pub fn release_task(&self, task: &TaskRef, node: &str) -> bool {
        let Ok(job) = self.job(&task.job_id) else {
            return false;
        };
        let Some(slot) = job.blocks.get(task.block).and_then(|b| b.tasks.get(task.task)) else {
            return false;
        };

        let mut rt = lock(&slot.runtime);
        if !rt.state.is_active() || rt.node.as_deref() != Some(node) {
            return false;
        }
        rt.state = TaskState::Pending;
        rt.node = None;
        rt.pending_seq = self.next_pending_seq();
        debug!(%task, node, "tarea devuelta a la cola");
        true
    }

    /* ---------------- gates ---------------- */

    /// Pausa, muerte y dependencias. Los filtros de hosts van por bloque.
    fn dispatchable(&self, job: &JobRuntime, jobs: &[Arc<JobRuntime>]) -> bool {
        if job.is_paused() || job.is_killed() {
            return false;
        }
        let Some(depend) = &job.depend else {
            return true;
        };
        jobs.iter()
            .filter(|other| other.seq < job.seq && depend.is_match(&other.definition.name))
            .all(|other| other.state().is_terminal())
    }

    /// ¿El nodo queda descartado para este bloque por errores recientes?
    fn avoids(&self, node: &str, job: &JobRuntime, block_idx: usize, now: Instant) -> bool {
        let block = &job.blocks[block_idx];
        if !block.policy.avoid_host {
            return false;
        }
        let key = ErrorKey::new(node, &job.id, block_idx);
        self.host_errors.count(&key, block.forgive_window(), now) > 0
    }

    /// ¿Hay otro nodo vivo que podría tomar esta tarea?
    fn has_alternative(
        &self,
        node: &str,
        job: &JobRuntime,
        block_idx: usize,
        failed_on: &HashSet<String>,
        now: Instant,
    ) -> bool {
        let block = &job.blocks[block_idx];
        self.nodes.iter().any(|entry| {
            let other = entry.key();
            entry.value().alive
                && other != node
                && !failed_on.contains(other)
                && block.hosts.admits(other)
                && !self.avoids(other, job, block_idx, now)
        })
    }

    /* ---------------- asignación ---------------- */

    /// Busca la tarea pendiente más antigua que este nodo puede ejecutar y se
    /// la asigna. `None` si no hay nada elegible.
    pub fn next_task(&self, node: &str, now: Instant) -> Option<TaskAssignment> {
        self.expire_jobs(now);

        loop {
            let jobs = self.snapshot();
            let mut best: Option<Candidate> = None;

            for job in &jobs {
                if !self.dispatchable(job, &jobs) {
                    continue;
                }
                for (bi, block) in job.blocks.iter().enumerate() {
                    if !block.hosts.admits(node) || self.avoids(node, job, bi, now) {
                        continue;
                    }
                    for (ti, slot) in block.tasks.iter().enumerate() {
                        let rt = lock(&slot.runtime);
                        if rt.state != TaskState::Pending {
                            continue;
                        }
                        if best.as_ref().is_some_and(|b| b.seq <= rt.pending_seq) {
                            continue;
                        }
                        if !block.policy.task_same_host
                            && rt.failed_on.contains(node)
                            && self.has_alternative(node, job, bi, &rt.failed_on, now)
                        {
                            continue;
                        }
                        best = Some(Candidate {
                            job: Arc::clone(job),
                            block: bi,
                            task: ti,
                            seq: rt.pending_seq,
                        });
                    }
                }
            }

            let candidate = best?;
            let job = &candidate.job;
            let block = &job.blocks[candidate.block];
            let slot = &block.tasks[candidate.task];

            let errors = {
                let mut rt = lock(&slot.runtime);
                // Otro nodo se la llevó (o el job cambió) entre la búsqueda y acá.
                if rt.state != TaskState::Pending
                    || rt.pending_seq != candidate.seq
                    || job.is_paused()
                    || job.is_killed()
                {
                    debug!(node, "candidato perdido, reintentando selección");
                    continue;
                }
                rt.state = TaskState::Assigned;
                rt.node = Some(node.to_string());
                rt.errors
            };

            lock(&job.started_at).get_or_insert_with(Utc::now);

            let task = TaskRef {
                job_id: job.id.clone(),
                block: candidate.block,
                task: candidate.task,
            };
            info!(%task, node, name = %slot.unit.name, errors, "tarea asignada");

            return Some(TaskAssignment {
                task,
                job_name: job.definition.name.clone(),
                block_name: block.name.clone(),
                service: block.service.clone(),
                name: slot.unit.name.clone(),
                command: slot.unit.command.clone(),
                frames: slot.unit.frames,
                step: block.step,
                errors,
            });
        }
    }

    /* ---------------- reportes ---------------- */

    /// Aplica un reporte de un worker.
    pub fn report(&self, report: &TaskReport, now: Instant) -> Result<ReportAck, DispatchError> {
        let job = self.job(&report.task.job_id)?;
        let block = job
            .blocks
            .get(report.task.block)
            .ok_or_else(|| DispatchError::TaskNotFound(report.task.clone()))?;
        let slot = block
            .tasks
            .get(report.task.task)
            .ok_or_else(|| DispatchError::TaskNotFound(report.task.clone()))?;

        if job.is_killed() {
            debug!(task = %report.task, node = %report.node, "job muerto, se descarta el resultado");
            return Ok(ReportAck::Discarded);
        }

        let mut rt = lock(&slot.runtime);
        if !rt.state.is_active() || rt.node.as_deref() != Some(report.node.as_str()) {
            debug!(task = %report.task, node = %report.node, state = ?rt.state, "reporte fuera de tiempo");
            return Ok(ReportAck::Stale);
        }

        let ack = match report.outcome {
            TaskOutcome::Running => {
                rt.state = TaskState::Running;
                ReportAck::Accepted
            }
            TaskOutcome::Done => {
                rt.state = TaskState::Done;
                rt.node = None;
                info!(task = %report.task, node = %report.node, "tarea terminada");
                ReportAck::Accepted
            }
            TaskOutcome::Error => {
                job.errors.fetch_add(1, Ordering::SeqCst);
                let host_errors = self.host_errors.record(
                    ErrorKey::new(&report.node, &job.id, report.task.block),
                    block.forgive_window(),
                    now,
                );

                rt.errors += 1;
                rt.failed_on.insert(report.node.clone());
                rt.node = None;

                if rt.errors < block.policy.retries {
                    rt.state = TaskState::Pending;
                    rt.pending_seq = self.next_pending_seq();
                    warn!(
                        task = %report.task,
                        node = %report.node,
                        errors = rt.errors,
                        retries = block.policy.retries,
                        host_errors,
                        message = report.message.as_deref().unwrap_or(""),
                        "tarea con error, reencolada"
                    );
                    ReportAck::Requeued
                } else {
                    rt.state = TaskState::Dead;
                    warn!(
                        task = %report.task,
                        node = %report.node,
                        errors = rt.errors,
                        host_errors,
                        message = report.message.as_deref().unwrap_or(""),
                        "tarea sin reintentos, marcada como DEAD"
                    );
                    ReportAck::Dead
                }
            }
        };
        drop(rt);

        if matches!(ack, ReportAck::Accepted | ReportAck::Dead) {
            job.mark_finished_if_terminal(now);
        }
        Ok(ack)
    }

    /* ---------------- tiempo de vida ---------------- */

    /// Mata los jobs que superaron su tiempo de vida. Todas sus tareas no
    /// terminadas pasan a `Dead`, tengan o no reintentos; las que estaban
    /// corriendo no se esperan. Devuelve los ids afectados.
    pub fn expire_jobs(&self, now: Instant) -> Vec<JobId> {
        let mut expired = Vec::new();
        for job in self.snapshot() {
            if job.is_killed() || !job.is_expired(now) || job.state().is_terminal() {
                continue;
            }
            job.killed.store(true, Ordering::SeqCst);

            let mut killed_tasks = 0;
            for slot in job.blocks.iter().flat_map(|b| b.tasks.iter()) {
                let mut rt = lock(&slot.runtime);
                if !rt.state.is_terminal() {
                    rt.state = TaskState::Dead;
                    rt.node = None;
                    killed_tasks += 1;
                }
            }
            warn!(
                job_id = %job.id,
                name = %job.definition.name,
                time_life_secs = job.time_life.as_secs(),
                killed_tasks,
                "job superó su tiempo de vida, marcado como DEAD"
            );
            job.mark_finished_if_terminal(now);
            expired.push(job.id.clone());
        }
        expired
    }

    /// Saca del controlador los jobs terminados hace más de `retention`.
    pub fn purge_finished(&self, now: Instant, retention: Duration) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|job| {
            let finished_at = lock(&job.finished).map(|(at, _)| at);
            let keep = match finished_at {
                Some(at) => now.saturating_duration_since(at) < retention,
                None => true,
            };
            if !keep {
                self.index.remove(&job.id);
                self.host_errors.forget_job(&job.id);
            }
            keep
        });
        before - jobs.len()
    }

    /* ---------------- control y consultas ---------------- */

    pub fn pause(&self, id: &str) -> Result<JobInfo, DispatchError> {
        let job = self.job(id)?;
        job.paused.store(true, Ordering::SeqCst);
        info!(job_id = %id, "job pausado");
        Ok(job.info())
    }

    pub fn resume(&self, id: &str) -> Result<JobInfo, DispatchError> {
        let job = self.job(id)?;
        job.paused.store(false, Ordering::SeqCst);
        info!(job_id = %id, "job reanudado");
        Ok(job.info())
    }

    pub fn job_info(&self, id: &str) -> Result<JobInfo, DispatchError> {
        Ok(self.job(id)?.info())
    }

    /// Todos los jobs en orden de envío.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.snapshot().iter().map(|j| j.info()).collect()
    }

    pub fn task_state(&self, task: &TaskRef) -> Result<TaskState, DispatchError> {
        let job = self.job(&task.job_id)?;
        job.blocks
            .get(task.block)
            .and_then(|b| b.tasks.get(task.task))
            .map(|slot| lock(&slot.runtime).state)
            .ok_or_else(|| DispatchError::TaskNotFound(task.clone()))
    }

    /// Errores vigentes de un nodo en un bloque.
    pub fn host_errors(&self, node: &str, job_id: &str, block: usize, now: Instant) -> u32 {
        let Ok(job) = self.job(job_id) else {
            return 0;
        };
        let forgive = job.blocks.get(block).and_then(|b| b.forgive_window());
        self.host_errors
            .count(&ErrorKey::new(node, job_id, block), forgive, now)
    }
}
