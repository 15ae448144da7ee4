use serde::{Deserialize, Serialize};

use crate::partition::{fill_frames, NumericRange};
use crate::task::TaskUnit;

/// Política de errores de un bloque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    /// Evitar un host que ya falló en este bloque (dentro de la ventana de forgive).
    pub avoid_host: bool,
    /// Cantidad de fallos que una tarea tolera antes de quedar muerta.
    pub retries: u32,
    /// Si una tarea que falló en un host puede reintentarse en el mismo host.
    pub task_same_host: bool,
    /// Segundos tras el último error en que el contador (host, bloque) vuelve
    /// a cero. 0 = nunca se perdona.
    pub forgive_time_secs: u64,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            avoid_host: true,
            retries: 1,
            task_same_host: true,
            forgive_time_secs: 18_000,
        }
    }
}

/// Tarea explícita, con nombre y comando propios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Task {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            files: Vec::new(),
        }
    }
}

/// Grupo de tareas con el mismo servicio, template de comando y política de
/// errores. Si `tasks` está vacío las tareas salen del rango numérico.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    /// Handler que procesa las tareas en el worker ("maya", "maya_redshift", ...).
    pub service: String,
    /// Template con placeholders `@#@` para frame inicial y final.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub numeric: Option<NumericRange>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default)]
    pub files: Vec<String>,
    /// Reemplaza la máscara de hosts del job para este bloque.
    #[serde(default)]
    pub hosts_mask: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Block {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            command: String::new(),
            numeric: None,
            error_policy: ErrorPolicy::default(),
            files: Vec::new(),
            hosts_mask: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Fija el rango numérico; invierte start/end si vienen al revés y
    /// lleva frames_per_task y step a un mínimo de 1.
    pub fn with_numeric(mut self, start: i64, end: i64, frames_per_task: i64, step: i64) -> Self {
        self.numeric = Some(NumericRange::new(start, end, frames_per_task, step));
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_hosts_mask(mut self, mask: impl Into<String>) -> Self {
        self.hosts_mask = Some(mask.into());
        self
    }

    pub fn add_task(&mut self, task: Task) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Cantidad de tareas que va a generar [`Block::task_units`], calculada
    /// sin materializarlas.
    pub fn task_count(&self) -> u64 {
        if !self.tasks.is_empty() {
            return self.tasks.len() as u64;
        }
        self.numeric.map_or(0, |n| n.task_count())
    }

    /// Materializa las unidades que el controlador va a despachar.
    ///
    /// Con tareas explícitas se usan tal cual (el comando cae al template del
    /// bloque si viene vacío); si no, una tarea por span del rango numérico,
    /// nombrada por su ordinal.
    pub fn task_units(&self) -> Vec<TaskUnit> {
        if !self.tasks.is_empty() {
            return self
                .tasks
                .iter()
                .enumerate()
                .map(|(index, task)| TaskUnit {
                    index,
                    name: if task.name.is_empty() {
                        ordinal(index)
                    } else {
                        task.name.clone()
                    },
                    command: if task.command.is_empty() {
                        self.command.clone()
                    } else {
                        task.command.clone()
                    },
                    frames: None,
                })
                .collect();
        }

        let Some(numeric) = self.numeric else {
            return Vec::new();
        };

        numeric
            .partition()
            .into_iter()
            .enumerate()
            .map(|(index, span)| TaskUnit {
                index,
                name: ordinal(index),
                command: fill_frames(&self.command, span),
                frames: Some(span),
            })
            .collect()
    }
}

fn ordinal(index: usize) -> String {
    format!("{:04}", index)
}
