use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{ErrorPolicy, Job, JobInfo, SubmitResponse, WorkerMetrics};
use reqwest::{header::AUTHORIZATION, Client, RequestBuilder};

use crate::gateway::{Gateway, GatewayConfig};
use crate::submitter::{FarmPolicy, MayaSubmitter, RenderSubmitter, SubmitMode, SubmitRequest};

#[derive(Parser)]
#[command(name = "rfarm")]
#[command(about = "CLI para enviar y controlar jobs de la granja de render")]
struct Cli {
    /// URL del master
    #[arg(long, env = "FARM_MASTER_URL", default_value = "http://localhost:8080")]
    master: String,

    /// Usuario dueño de los jobs enviados
    #[arg(long, env = "USER", default_value = "")]
    user: String,

    /// Token para el alta de jobs
    #[arg(long, env = "FARM_API_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job descrito en un archivo JSON
    Submit {
        #[arg(value_name = "JOB_JSON")]
        path: String,
    },
    /// Arma y envía jobs de render de una escena de Maya
    Render(RenderArgs),
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista todos los jobs
    Jobs,
    /// Pausa un job
    Pause {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Reanuda un job pausado
    Resume {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los workers y sus métricas
    Workers,
}

#[derive(Args)]
struct RenderArgs {
    /// Escena a renderizar
    #[arg(value_name = "SCENE")]
    scene: String,

    #[arg(long, default_value_t = 1)]
    start: i64,
    #[arg(long, default_value_t = 1)]
    end: i64,
    #[arg(long, default_value_t = 1)]
    frames_per_task: i64,
    #[arg(long, default_value_t = 1)]
    by_frame: i64,

    #[arg(long, value_enum, default_value_t = SubmitMode::OneBlockAllLayers)]
    mode: SubmitMode,
    /// Layer renderizable (repetible); necesaria en los modos por layer
    #[arg(long = "layer")]
    layers: Vec<String>,

    /// Nombre del job; por defecto el nombre de archivo de la escena
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    camera: Option<String>,
    #[arg(long)]
    project: Option<String>,
    /// Prefijo de salida de las imágenes
    #[arg(long, default_value = "")]
    output: String,
    #[arg(long, default_value = "")]
    annotation: String,

    #[arg(long, default_value = "")]
    depend_mask_global: String,
    #[arg(long, default_value = "")]
    hosts_mask: String,
    #[arg(long, default_value = "")]
    hosts_mask_exclude: String,
    /// Horas de vida del job; 0 = 240
    #[arg(long, default_value_t = 0)]
    life_time_hours: u64,
    #[arg(long, default_value_t = 1)]
    retries: u32,
}

impl RenderArgs {
    fn into_parts(self) -> (SubmitRequest, FarmPolicy) {
        let mut req = SubmitRequest::new(self.scene, self.start, self.end);
        if let Some(name) = self.name {
            req.job_name = name;
        }
        req.render_directory = self.output;
        req.camera = self.camera;
        req.project = self.project;
        req.layers = self.layers;
        req.mode = self.mode;
        req.frames_per_task = self.frames_per_task;
        req.by_frame = self.by_frame;
        req.annotation = self.annotation;

        let policy = FarmPolicy {
            depend_mask_global: self.depend_mask_global,
            hosts_mask: self.hosts_mask,
            hosts_mask_exclude: self.hosts_mask_exclude,
            error_policy: ErrorPolicy {
                retries: self.retries,
                ..ErrorPolicy::default()
            },
            life_time_hours: self.life_time_hours,
        };
        (req, policy)
    }
}

fn print_submit(job: &Job, resp: &SubmitResponse) {
    if resp.accepted {
        println!("Job enviado:");
        println!("  id: {}", resp.id.as_deref().unwrap_or("-"));
        println!("  nombre: {}", job.name);
        for (k, v) in &resp.resolved {
            println!("  {}: {}", k, v);
        }
    } else {
        println!(
            "Job {} NO aceptado: {}",
            job.name,
            resp.error.as_deref().unwrap_or("sin detalle")
        );
    }
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {}{}", job.state, if job.paused { " (pausado)" } else { "" });
    if !job.user_name.is_empty() {
        println!("  usuario: {}", job.user_name);
    }

    let t = &job.tasks;
    println!(
        "  tareas: total={}, pendientes={}, corriendo={}, completadas={}, muertas={}",
        t.total,
        t.pending,
        t.assigned + t.running,
        t.done,
        t.dead
    );
    if t.total > 0 {
        let pct = ((t.done + t.dead) as f64 / t.total as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    } else {
        println!("  progreso: (sin tareas)");
    }
    println!("  errores: {}", job.errors);
    println!("  tiempo de vida: {} s", job.time_life_secs);
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
}

fn print_worker(w: &WorkerMetrics) {
    println!("Worker {}", w.worker_id);
    println!("  host           : {}", w.hostname);
    println!("  dead           : {}", w.dead);
    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
    println!(
        "  concurrency    : {}/{}",
        w.active_tasks, w.max_concurrency
    );
    println!(
        "  tareas         : started={}, ok={}, failed={}",
        w.tasks_started, w.tasks_succeeded, w.tasks_failed
    );
    match w.cpu_percent {
        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
        None => println!("  cpu_percent    : (sin datos)"),
    }
    match w.mem_bytes {
        Some(mem) => println!("  mem_bytes      : {}", mem),
        None => println!("  mem_bytes      : (sin datos)"),
    }
    println!();
}

fn with_token(req: RequestBuilder, token: &Option<String>) -> RequestBuilder {
    match token {
        Some(t) => req.header(AUTHORIZATION, format!("Bearer {}", t)),
        None => req,
    }
}

async fn job_action(client: &Client, config: &GatewayConfig, id: &str, action: &str) -> Result<()> {
    let url = config.url(&format!("/api/v1/jobs/{id}/{action}"));
    let resp = with_token(client.post(&url), &config.token).send().await?;
    if resp.status().is_success() {
        let job: JobInfo = resp.json().await?;
        print_job(&job);
    } else {
        println!("Error: job no encontrado (status {})", resp.status());
    }
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig {
        endpoint: cli.master,
        user: cli.user,
        token: cli.token,
    };
    let client = Client::new();

    match cli.command {
        Commands::Submit { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("no se pudo leer {}", path))?;
            let mut job: Job =
                serde_json::from_str(&raw).with_context(|| format!("{} no es un job válido", path))?;

            let gateway = Gateway::connect(config);
            let resp = gateway.submit(&mut job).await?;
            print_submit(&job, &resp);
            if !resp.accepted {
                bail!("envío fallido");
            }
        }

        Commands::Render(args) => {
            let (req, policy) = args.into_parts();
            let jobs = MayaSubmitter::new(policy).build_jobs(&req);
            if jobs.is_empty() {
                bail!("no hay layers para enviar (usar --layer)");
            }

            let gateway = Gateway::connect(config);
            let mut failed = 0;
            for mut job in jobs {
                let resp = gateway.submit(&mut job).await?;
                print_submit(&job, &resp);
                if !resp.accepted {
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{} job(s) no aceptados", failed);
            }
        }

        Commands::Status { id } => {
            let resp = client.get(config.url(&format!("/api/v1/jobs/{id}"))).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("Error: job no encontrado (status {})", resp.status());
            }
        }

        Commands::Jobs => {
            let resp = client.get(config.url("/api/v1/jobs")).send().await?;
            let jobs: Vec<JobInfo> = resp.error_for_status()?.json().await?;
            if jobs.is_empty() {
                println!("No hay jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<8} {:>4}/{:<4} {}",
                    job.id,
                    job.state.to_string(),
                    job.tasks.done,
                    job.tasks.total,
                    job.name
                );
            }
        }

        Commands::Pause { id } => job_action(&client, &config, &id, "pause").await?,
        Commands::Resume { id } => job_action(&client, &config, &id, "resume").await?,

        Commands::Workers => {
            let resp = client.get(config.url("/api/v1/workers")).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                }
                for w in &workers {
                    print_worker(w);
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }
    }

    Ok(())
}
