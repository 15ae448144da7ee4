use std::time::{Duration, Instant};

use common::{JobId, NodeId};
use dashmap::DashMap;

/// Clave del contador de errores: un nodo dentro de un bloque de un job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorKey {
    pub node: NodeId,
    pub job: JobId,
    pub block: usize,
}

impl ErrorKey {
    pub fn new(node: &str, job: &str, block: usize) -> Self {
        Self {
            node: node.to_string(),
            job: job.to_string(),
            block,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ErrorRecord {
    count: u32,
    last_error: Instant,
}

/// Contadores de errores por (nodo, bloque) con perdón por tiempo.
///
/// Cada actualización ocurre con la entrada del mapa tomada, así que dos
/// reportes concurrentes sobre la misma clave se serializan sin bloquear
/// al resto de las claves.
#[derive(Debug, Default)]
pub struct HostErrors {
    inner: DashMap<ErrorKey, ErrorRecord>,
}

fn forgiven(forgive: Option<Duration>, last_error: Instant, now: Instant) -> bool {
    match forgive {
        Some(window) => now.saturating_duration_since(last_error) >= window,
        None => false,
    }
}

impl HostErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un error y devuelve el contador resultante. Si ya pasó la
    /// ventana de perdón desde el último error, el contador arranca de cero.
    pub fn record(&self, key: ErrorKey, forgive: Option<Duration>, now: Instant) -> u32 {
        let mut entry = self.inner.entry(key).or_insert(ErrorRecord {
            count: 0,
            last_error: now,
        });
        if forgiven(forgive, entry.last_error, now) {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_error = now;
        entry.count
    }

    /// Errores vigentes para la clave (0 si ya fueron perdonados).
    pub fn count(&self, key: &ErrorKey, forgive: Option<Duration>, now: Instant) -> u32 {
        match self.inner.get(key) {
            Some(rec) if !forgiven(forgive, rec.last_error, now) => rec.count,
            _ => 0,
        }
    }

    /// Borra las entradas de un job (cuando se lo elimina del controlador).
    pub fn forget_job(&self, job: &str) {
        self.inner.retain(|k, _| k.job != job);
    }
}
