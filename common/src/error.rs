use thiserror::Error;

/// Job mal formado. Se detecta localmente antes de cualquier llamada de red
/// y nunca se reintenta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("job name is empty")]
    EmptyJobName,

    #[error("job has no blocks")]
    NoBlocks,

    #[error("block #{0} has an empty name")]
    EmptyBlockName(usize),

    #[error("duplicate block name: {0}")]
    DuplicateBlock(String),

    #[error("block {0} has neither a numeric range nor explicit tasks")]
    NoTasks(String),

    #[error("job expands to {tasks} tasks, the limit is {limit}")]
    TooManyTasks { tasks: u64, limit: u64 },

    #[error("invalid {field} pattern '{pattern}': {reason}")]
    InvalidMask {
        field: &'static str,
        pattern: String,
        reason: String,
    },
}
