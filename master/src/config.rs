use std::env;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_JOB_RETENTION_SECS: u64 = 24 * 3600;

/// Configuración del master, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// `FARM_LISTEN_ADDR`
    pub listen_addr: String,
    /// `FARM_WORKER_TIMEOUT_SECS`: sin heartbeat durante este tiempo el worker
    /// se da por muerto y sus tareas vuelven a la cola.
    pub worker_timeout: Duration,
    /// `FARM_SWEEP_INTERVAL_SECS`
    pub sweep_interval: Duration,
    /// `FARM_JOB_RETENTION_SECS`: cuánto se conserva un job terminado.
    pub job_retention: Duration,
    /// `FARM_API_TOKEN`: si está definido, el alta de jobs exige
    /// `Authorization: Bearer <token>`.
    pub api_token: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_HEARTBEAT_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            job_retention: Duration::from_secs(DEFAULT_JOB_RETENTION_SECS),
            api_token: None,
        }
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

impl MasterConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("FARM_LISTEN_ADDR")
                .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string()),
            worker_timeout: env_secs(
                "FARM_WORKER_TIMEOUT_SECS",
                DEFAULT_WORKER_HEARTBEAT_TIMEOUT_SECS,
            ),
            sweep_interval: env_secs("FARM_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
            job_retention: env_secs("FARM_JOB_RETENTION_SECS", DEFAULT_JOB_RETENTION_SECS),
            api_token: env::var("FARM_API_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.worker_timeout, Duration::from_secs(20));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert!(cfg.api_token.is_none());
    }

    #[test]
    fn env_secs_falls_back_on_garbage() {
        env::set_var("FARM_TEST_SECS_GARBAGE", "diez");
        assert_eq!(env_secs("FARM_TEST_SECS_GARBAGE", 7), Duration::from_secs(7));
        env::set_var("FARM_TEST_SECS_OK", "42");
        assert_eq!(env_secs("FARM_TEST_SECS_OK", 7), Duration::from_secs(42));
    }
}
