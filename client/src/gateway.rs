//! Gateway de envío: valida un [`Job`], lo manda al controlador y devuelve
//! el resultado. Es la única parte del cliente que habla con la red.

use async_trait::async_trait;
use common::{Job, SubmitResponse, ValidationError};
use reqwest::{header::AUTHORIZATION, Client};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Falla de comunicación con el controlador.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("controller unreachable: {0}")]
    Unreachable(String),

    #[error("controller returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed acknowledgment: {0}")]
    Malformed(String),
}

/// Canal por el que viaja el pedido de alta de job.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Un único pedido "crear job", sin reintentos.
    async fn create_job(&self, job: &Job) -> Result<SubmitResponse, TransportError>;
}

/// Endpoint y credenciales; se pasan explícitamente, nunca se leen del
/// entorno dentro del gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// URL base del controlador, por ejemplo `http://master:8080`.
    pub endpoint: String,
    /// Se usa como `user_name` de los jobs que no traen uno.
    pub user: String,
    pub token: Option<String>,
}

impl GatewayConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            user: String::new(),
            token: None,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }
}

/// JSON sobre HTTP contra `POST /api/v1/jobs`.
pub struct HttpTransport {
    client: Client,
    config: GatewayConfig,
}

impl HttpTransport {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_job(&self, job: &Job) -> Result<SubmitResponse, TransportError> {
        let mut req = self.client.post(self.config.url("/api/v1/jobs")).json(job);
        if let Some(token) = &self.config.token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        // El controlador contesta con SubmitResponse también en los rechazos
        match serde_json::from_str::<SubmitResponse>(&body) {
            Ok(ack) => Ok(ack),
            Err(_) if !status.is_success() => Err(TransportError::Status {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(TransportError::Malformed(e.to_string())),
        }
    }
}

pub struct Gateway<T: Transport> {
    transport: T,
    user: String,
}

impl Gateway<HttpTransport> {
    pub fn connect(config: GatewayConfig) -> Self {
        let user = config.user.clone();
        Self {
            transport: HttpTransport::new(config),
            user,
        }
    }
}

impl<T: Transport> Gateway<T> {
    pub fn new(transport: T, user: impl Into<String>) -> Self {
        Self {
            transport,
            user: user.into(),
        }
    }

    /// Envía el job.
    ///
    /// - Job inválido: `Err(ValidationError)` y no se toca la red.
    /// - Falla de transporte o ack ilegible: `accepted = false` con el
    ///   diagnóstico en `error`; reintentar queda a cargo del llamador.
    /// - Aceptado: el id asignado queda guardado en `job.id`.
    ///
    /// Cada llamada es un alta nueva; dos llamadas crean dos jobs.
    pub async fn submit(&self, job: &mut Job) -> Result<SubmitResponse, ValidationError> {
        job.validate()?;
        if job.user_name.is_empty() {
            job.user_name = self.user.clone();
        }

        let resp = match self.transport.create_job(job).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(name = %job.name, error = %e, "no se pudo enviar el job");
                return Ok(SubmitResponse::rejected(e.to_string()));
            }
        };

        if !resp.accepted {
            warn!(name = %job.name, error = ?resp.error, "el controlador rechazó el job");
            return Ok(resp);
        }

        match &resp.id {
            Some(id) => {
                info!(name = %job.name, id = %id, "job aceptado");
                debug!(resolved = ?resp.resolved, "campos resueltos");
                job.id = Some(id.clone());
                Ok(resp)
            }
            None => Ok(SubmitResponse::rejected(
                TransportError::Malformed("accepted without job id".into()).to_string(),
            )),
        }
    }
}
