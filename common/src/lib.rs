//! Modelo compartido entre el controlador, los workers y el cliente:
//! jobs, bloques y tareas, el particionado de rangos de frames, las máscaras
//! de hosts y los tipos que viajan por la red.

pub mod block;
pub mod error;
pub mod job;
pub mod mask;
pub mod partition;
pub mod task;
pub mod worker;

pub use block::{Block, ErrorPolicy, Task};
pub use error::ValidationError;
pub use job::{
    resolve_time_life, Job, JobId, JobInfo, JobState, SubmitResponse, TaskCounts,
    DEFAULT_TIME_LIFE_SECS, MAX_TASKS_PER_JOB,
};
pub use mask::{HostFilter, Mask};
pub use partition::{fill_frames, partition, FrameSpan, NumericRange, FRAME_PLACEHOLDER};
pub use task::{
    NodeId, ReportAck, TaskAssignment, TaskOutcome, TaskRef, TaskReport, TaskReportResponse,
    TaskState, TaskUnit,
};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerId, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
