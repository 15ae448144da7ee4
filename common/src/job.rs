use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::error::ValidationError;
use crate::mask::{HostFilter, Mask};

pub type JobId = String;

/// Time-to-live que se usa cuando el job llega con 0 (240 horas).
/// 0 nunca significa "infinito".
pub const DEFAULT_TIME_LIFE_SECS: u64 = 240 * 3600;

/// Máximo de tareas que puede generar un job (sumando todos sus bloques).
/// El controlador materializa cada tarea en memoria al aceptar el job.
pub const MAX_TASKS_PER_JOB: u64 = 100_000;

pub fn resolve_time_life(secs: u64) -> u64 {
    if secs == 0 {
        DEFAULT_TIME_LIFE_SECS
    } else {
        secs
    }
}

/// Unidad de trabajo que se envía a la granja: metadatos, restricciones de
/// hosts y dependencias, tiempo de vida y la lista ordenada de bloques.
///
/// Se construye del lado del cliente sin validar nada; la validación ocurre
/// una sola vez en [`Job::validate`], que el gateway llama antes de enviar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    pub name: String,

    /// Lo asigna el controlador al aceptar el job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,

    #[serde(default)]
    pub annotation: String,

    #[serde(default)]
    pub user_name: String,

    /// Patrón sobre nombres de jobs enviados antes; el job no arranca hasta
    /// que todos los que matchean terminan.
    #[serde(default)]
    pub depend_mask_global: String,

    #[serde(default)]
    pub hosts_mask: String,

    #[serde(default)]
    pub hosts_mask_exclude: String,

    /// Segundos; 0 = usar [`DEFAULT_TIME_LIFE_SECS`].
    #[serde(default)]
    pub time_life_secs: u64,

    /// Carpetas informativas ("input", "output", ...). No afectan el scheduling.
    #[serde(default)]
    pub folders: BTreeMap<String, String>,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Agrega un bloque al final. No hay operación de borrado.
    pub fn add_block(&mut self, block: Block) -> &mut Self {
        self.blocks.push(block);
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }

    pub fn with_user_name(mut self, user: impl Into<String>) -> Self {
        self.user_name = user.into();
        self
    }

    pub fn with_depend_mask_global(mut self, mask: impl Into<String>) -> Self {
        self.depend_mask_global = mask.into();
        self
    }

    pub fn with_hosts_mask(mut self, mask: impl Into<String>) -> Self {
        self.hosts_mask = mask.into();
        self
    }

    pub fn with_hosts_mask_exclude(mut self, mask: impl Into<String>) -> Self {
        self.hosts_mask_exclude = mask.into();
        self
    }

    pub fn with_time_life_secs(mut self, secs: u64) -> Self {
        self.time_life_secs = secs;
        self
    }

    pub fn with_folder(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.folders.insert(name.into(), path.into());
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Tiempo de vida efectivo en segundos.
    pub fn resolved_time_life_secs(&self) -> u64 {
        resolve_time_life(self.time_life_secs)
    }

    /// Chequeos previos al envío: nombre, bloques, nombres de bloque únicos,
    /// cada bloque con algo para ejecutar, máscaras que compilan y no más de
    /// [`MAX_TASKS_PER_JOB`] tareas.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyJobName);
        }
        if self.blocks.is_empty() {
            return Err(ValidationError::NoBlocks);
        }

        HostFilter::compile(&self.hosts_mask, &self.hosts_mask_exclude)?;
        Mask::parse_field("depend_mask_global", &self.depend_mask_global)?;

        let mut seen: HashSet<&str> = HashSet::new();
        let mut tasks: u64 = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if block.name.trim().is_empty() {
                return Err(ValidationError::EmptyBlockName(i));
            }
            if !seen.insert(block.name.as_str()) {
                return Err(ValidationError::DuplicateBlock(block.name.clone()));
            }
            if block.numeric.is_none() && block.tasks.is_empty() {
                return Err(ValidationError::NoTasks(block.name.clone()));
            }
            if let Some(mask) = &block.hosts_mask {
                Mask::parse_field("block hosts_mask", mask)?;
            }
            tasks = tasks.saturating_add(block.task_count());
        }

        if tasks > MAX_TASKS_PER_JOB {
            return Err(ValidationError::TooManyTasks {
                tasks,
                limit: MAX_TASKS_PER_JOB,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Aceptado, todavía ninguna tarea asignada.
    Pending,
    Running,
    Done,
    Dead,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Done => write!(f, "done"),
            JobState::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u32,
    pub pending: u32,
    pub assigned: u32,
    pub running: u32,
    pub done: u32,
    pub dead: u32,
}

/// Estado de un job tal como lo ve el controlador.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub paused: bool,
    pub user_name: String,
    pub annotation: String,
    pub time_life_secs: u64,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub tasks: TaskCounts,
    /// Reportes de error recibidos (incluye los que se reintentaron).
    pub errors: u32,
}

/// Respuesta a un envío de job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    pub id: Option<JobId>,
    /// Campos resueltos por el controlador (por ejemplo `time_life_secs`).
    #[serde(default)]
    pub resolved: BTreeMap<String, serde_json::Value>,
    pub error: Option<String>,
}

impl SubmitResponse {
    pub fn accepted(id: JobId, resolved: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            accepted: true,
            id: Some(id),
            resolved,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            id: None,
            resolved: BTreeMap::new(),
            error: Some(error.into()),
        }
    }
}
