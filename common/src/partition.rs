use serde::{Deserialize, Serialize};

/// Placeholder de frame dentro de un template de comando.
/// La primera aparición se reemplaza por el frame inicial, el resto por el final.
pub const FRAME_PLACEHOLDER: &str = "@#@";

/// Rango numérico de un bloque: (start, end, frames por tarea, step).
///
/// Siempre está normalizado: `start <= end` (si llegan invertidos se
/// intercambian) y `frames_per_task`, `step` son como mínimo 1.
/// Al deserializar pasa por la misma normalización.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawRange")]
pub struct NumericRange {
    start: i64,
    end: i64,
    frames_per_task: i64,
    step: i64,
}

#[derive(Deserialize)]
struct RawRange {
    start: i64,
    end: i64,
    #[serde(default = "one")]
    frames_per_task: i64,
    #[serde(default = "one")]
    step: i64,
}

fn one() -> i64 {
    1
}

impl From<RawRange> for NumericRange {
    fn from(raw: RawRange) -> Self {
        NumericRange::new(raw.start, raw.end, raw.frames_per_task, raw.step)
    }
}

impl NumericRange {
    pub fn new(start: i64, end: i64, frames_per_task: i64, step: i64) -> Self {
        let (start, end) = if start > end { (end, start) } else { (start, end) };
        Self {
            start,
            end,
            frames_per_task: frames_per_task.max(1),
            step: step.max(1),
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn frames_per_task(&self) -> i64 {
        self.frames_per_task
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    /// Cantidad de frames del rango (inclusive). Satura en `u64::MAX`.
    pub fn frame_count(&self) -> u64 {
        self.end.abs_diff(self.start).saturating_add(1)
    }

    /// Cantidad de tareas implícitas que genera el rango, sin materializarlas.
    pub fn task_count(&self) -> u64 {
        self.frame_count().div_ceil(self.frames_per_task as u64)
    }

    /// Tareas implícitas del rango.
    pub fn partition(&self) -> Vec<FrameSpan> {
        partition(self.start, self.end, self.frames_per_task, self.step)
    }
}

/// Sub-rango contiguo `[start, end]` que cubre una tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSpan {
    pub start: i64,
    pub end: i64,
}

impl FrameSpan {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Frames que realmente se evalúan dentro del span cuando hay skip
    /// rendering: `start, start + step, ...` sin pasar de `end`.
    pub fn rendered_frames(&self, step: i64) -> impl Iterator<Item = i64> {
        let step = step.max(1);
        let end = self.end;
        let mut next = Some(self.start).filter(|s| *s <= end);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.checked_add(step).filter(|n| *n <= end);
            Some(current)
        })
    }
}

/// Divide `[start, end]` en tareas de `frames_per_task` frames.
///
/// Asume `start <= end` (el llamador ya hizo el swap); con `start > end`
/// devuelve una lista vacía. El `step` no cambia el ancho de cada tarea:
/// sólo decide qué frames se renderizan dentro de ella
/// (ver [`FrameSpan::rendered_frames`]). La última tarea se trunca a `end`.
pub fn partition(start: i64, end: i64, frames_per_task: i64, _step: i64) -> Vec<FrameSpan> {
    let frames_per_task = frames_per_task.max(1);

    let mut spans = Vec::new();
    if start > end {
        return spans;
    }

    let mut chunk_start = start;
    loop {
        let chunk_end = chunk_start
            .saturating_add(frames_per_task - 1)
            .min(end);
        spans.push(FrameSpan::new(chunk_start, chunk_end));

        if chunk_end >= end {
            break;
        }
        chunk_start = chunk_end + 1;
    }

    spans
}

/// Sustituye los placeholders `@#@` del template con los frames del span.
pub fn fill_frames(template: &str, span: FrameSpan) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    let mut first = true;

    while let Some(pos) = rest.find(FRAME_PLACEHOLDER) {
        out.push_str(&rest[..pos]);
        let frame = if first { span.start } else { span.end };
        out.push_str(&frame.to_string());
        first = false;
        rest = &rest[pos + FRAME_PLACEHOLDER.len()..];
    }
    out.push_str(rest);
    out
}
