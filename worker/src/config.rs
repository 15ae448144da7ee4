use std::env;
use std::time::Duration;

const DEFAULT_MASTER_URL: &str = "http://master:8080";
const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `FARM_MASTER_URL`
    pub master_url: String,
    /// `WORKER_HOSTNAME`; por defecto el hostname de la máquina. Es el
    /// nombre que se compara contra las máscaras de hosts de los jobs.
    pub hostname: String,
    /// `WORKER_CONCURRENCY`
    pub max_concurrency: u32,
    /// `WORKER_POLL_INTERVAL_MS`: espera cuando no hay tareas.
    pub poll_interval: Duration,
    /// `WORKER_HEARTBEAT_INTERVAL_MS`
    pub heartbeat_interval: Duration,
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(
        env::var(name)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

fn machine_hostname() -> String {
    hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            master_url: env::var("FARM_MASTER_URL")
                .unwrap_or_else(|_| DEFAULT_MASTER_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            hostname: env::var("WORKER_HOSTNAME")
                .ok()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(machine_hostname),
            max_concurrency: env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
                .max(1),
            poll_interval: env_millis("WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            heartbeat_interval: env_millis(
                "WORKER_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.master_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let cfg = WorkerConfig {
            master_url: "http://localhost:8080".into(),
            hostname: "ws01".into(),
            max_concurrency: 1,
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(10),
        };
        assert_eq!(
            cfg.url("/api/v1/tasks/next"),
            "http://localhost:8080/api/v1/tasks/next"
        );
    }

    #[test]
    fn env_millis_uses_default_when_missing() {
        assert_eq!(
            env_millis("WORKER_TEST_MISSING_MS", 250),
            Duration::from_millis(250)
        );
    }
}
