use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::partition::FrameSpan;

pub type NodeId = String;

/// Tarea ya materializada dentro de un bloque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUnit {
    /// Posición dentro del bloque.
    pub index: usize,
    pub name: String,
    /// Comando final (placeholders ya sustituidos en tareas implícitas).
    pub command: String,
    /// `None` para tareas explícitas.
    pub frames: Option<FrameSpan>,
}

/// Dirección de una tarea dentro del controlador: job, bloque y tarea.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub job_id: JobId,
    pub block: usize,
    pub task: usize,
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}:{}]", self.job_id, self.block, self.task)
    }
}

/// Estado de ejecución de una tarea (sólo del lado del controlador).
///
/// `pending -> assigned -> running -> done`; un error vuelve a `pending`
/// mientras queden reintentos y si no termina en `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Done,
    Dead,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Dead)
    }

    /// Tiene un worker asignado (assigned o running).
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

/// Lo que el controlador le entrega a un worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: TaskRef,
    pub job_name: String,
    pub block_name: String,
    pub service: String,
    pub name: String,
    pub command: String,
    pub frames: Option<FrameSpan>,
    /// Frames a saltear dentro del span.
    pub step: i64,
    /// Errores previos de esta tarea.
    pub errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Running,
    Done,
    Error,
}

/// Reporte de progreso o fallo que manda un worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: TaskRef,
    pub node: NodeId,
    pub outcome: TaskOutcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportAck {
    /// Reporte aplicado.
    Accepted,
    /// La tarea falló y volvió a la cola.
    Requeued,
    /// La tarea agotó sus reintentos.
    Dead,
    /// El job está muerto; el resultado se descarta.
    Discarded,
    /// La tarea no estaba asignada a ese nodo (reporte tardío o duplicado).
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReportResponse {
    pub ack: ReportAck,
}
