//! Integraciones con aplicaciones de render: convierten un pedido de envío
//! en uno o más jobs listos para el gateway.

use std::path::Path;

use clap::ValueEnum;
use common::{resolve_time_life, Block, ErrorPolicy, Job};

/// Servicio del worker que procesa los bloques de Maya.
pub const MAYA_SERVICE: &str = "maya_redshift";

const DEFAULT_LAYER: &str = "defaultRenderLayer";

/// Cómo se reparten las render layers entre jobs y bloques.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SubmitMode {
    /// Un job con un solo bloque que renderiza todas las layers.
    #[default]
    OneBlockAllLayers,
    /// Un job con un bloque por layer.
    BlockPerLayer,
    /// Un job por layer, llamado `"<job> - <layer>"`.
    JobPerLayer,
}

/// Restricciones de granja que se aplican a todos los jobs generados.
#[derive(Debug, Clone, Default)]
pub struct FarmPolicy {
    pub depend_mask_global: String,
    pub hosts_mask: String,
    pub hosts_mask_exclude: String,
    pub error_policy: ErrorPolicy,
    /// Horas; 0 = 240 horas.
    pub life_time_hours: u64,
}

impl FarmPolicy {
    pub fn time_life_secs(&self) -> u64 {
        resolve_time_life(self.life_time_hours.saturating_mul(3600))
    }
}

/// Todo lo que hace falta para armar los jobs, cargado una sola vez.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_name: String,
    pub scene_path: String,
    /// Prefijo de salida; `masterLayer` se reemplaza por el nombre de cada layer.
    pub render_directory: String,
    pub camera: Option<String>,
    pub project: Option<String>,
    /// Layers renderizables. Sólo se usan en los modos por layer.
    pub layers: Vec<String>,
    pub mode: SubmitMode,
    pub start_frame: i64,
    pub end_frame: i64,
    pub frames_per_task: i64,
    pub by_frame: i64,
    pub annotation: String,
}

impl SubmitRequest {
    pub fn new(scene_path: impl Into<String>, start_frame: i64, end_frame: i64) -> Self {
        let scene_path = scene_path.into();
        let job_name = Path::new(&scene_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| scene_path.clone());
        Self {
            job_name,
            scene_path,
            render_directory: String::new(),
            camera: None,
            project: None,
            layers: Vec::new(),
            mode: SubmitMode::default(),
            start_frame,
            end_frame,
            frames_per_task: 1,
            by_frame: 1,
            annotation: String::new(),
        }
    }
}

pub trait RenderSubmitter {
    /// Línea de comandos del render, con `@#@` en lugar de los frames.
    fn build_command(&self, req: &SubmitRequest, layer: Option<&str>) -> String;

    /// Jobs a enviar, en orden.
    fn build_jobs(&self, req: &SubmitRequest) -> Vec<Job>;
}

pub struct MayaSubmitter {
    policy: FarmPolicy,
}

impl MayaSubmitter {
    pub fn new(policy: FarmPolicy) -> Self {
        Self { policy }
    }

    fn block(&self, req: &SubmitRequest, name: &str, layer: Option<&str>) -> Block {
        Block::new(name, MAYA_SERVICE)
            .with_command(self.build_command(req, layer))
            .with_numeric(req.start_frame, req.end_frame, req.frames_per_task, req.by_frame)
            .with_error_policy(self.policy.error_policy)
    }

    fn job(&self, req: &SubmitRequest, name: String, output: String) -> Job {
        let mut job = Job::new(name)
            .with_annotation(req.annotation.clone())
            .with_depend_mask_global(self.policy.depend_mask_global.clone())
            .with_hosts_mask(self.policy.hosts_mask.clone())
            .with_hosts_mask_exclude(self.policy.hosts_mask_exclude.clone())
            .with_time_life_secs(self.policy.time_life_secs());

        if let Some(dir) = Path::new(&req.scene_path).parent() {
            job = job.with_folder("input", dir.to_string_lossy());
        }
        if !output.is_empty() {
            job = job.with_folder("output", output);
        }
        job
    }
}

/// Carpeta de salida de una layer: `masterLayer` pasa a ser el nombre de la
/// layer sin el prefijo `rs_`.
fn layer_output(render_directory: &str, layer: &str) -> String {
    if layer == DEFAULT_LAYER {
        render_directory.to_string()
    } else {
        render_directory.replace("masterLayer", &layer.replace("rs_", ""))
    }
}

impl RenderSubmitter for MayaSubmitter {
    fn build_command(&self, req: &SubmitRequest, layer: Option<&str>) -> String {
        let mut command = vec![
            "mayarender".to_string(),
            "-r file".to_string(),
            format!("-s @#@ -e @#@ -b {}", req.by_frame.max(1)),
        ];

        if let Some(camera) = req.camera.as_deref().filter(|c| !c.is_empty()) {
            command.push(format!("-cam \"{}\"", camera));
        }
        if let Some(layer) = layer.filter(|l| !l.is_empty()) {
            command.push(format!("-rl \"{}\"", layer));
        }
        if let Some(project) = req.project.as_deref().filter(|p| !p.is_empty()) {
            command.push(format!("-proj \"{}\"", project));
        }
        if !req.scene_path.is_empty() {
            command.push(req.scene_path.clone());
        }

        command.join(" ")
    }

    fn build_jobs(&self, req: &SubmitRequest) -> Vec<Job> {
        match req.mode {
            SubmitMode::OneBlockAllLayers => {
                let mut job = self.job(req, req.job_name.clone(), req.render_directory.clone());
                job.add_block(self.block(req, "All Layers", None));
                vec![job]
            }
            SubmitMode::BlockPerLayer => {
                let mut job = self.job(req, req.job_name.clone(), req.render_directory.clone());
                for layer in &req.layers {
                    let mut block = self.block(req, layer, Some(layer));
                    block.files = vec![layer_output(&req.render_directory, layer)];
                    job.add_block(block);
                }
                vec![job]
            }
            SubmitMode::JobPerLayer => req
                .layers
                .iter()
                .map(|layer| {
                    let output = layer_output(&req.render_directory, layer);
                    let mut job =
                        self.job(req, format!("{} - {}", req.job_name, layer), output);
                    job.add_block(self.block(req, layer, Some(layer)));
                    job
                })
                .collect(),
        }
    }
}
