use common::{TaskRef, WorkerId};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use crate::config::MasterConfig;
use crate::dispatch::DispatchEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    pub config: Arc<MasterConfig>,
}

impl AppState {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            engine: Arc::new(DispatchEngine::new()),
            workers: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    /// Nombre del nodo; es lo que ve el motor de despacho.
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,
    /// Tareas entregadas a este worker que todavía no reportaron final.
    pub in_flight: HashSet<TaskRef>,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            in_flight: HashSet::new(),
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}
