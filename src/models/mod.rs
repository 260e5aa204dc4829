pub mod clock;
pub mod config;
pub mod job;
pub mod record;
pub mod stage;

pub use clock::{Clock, SystemClock};
#[cfg(test)]
pub use clock::FakeClock;
pub use config::{PipelineConfig, RateLimitConfig, ToolConfig, ToolsConfig};
pub use job::JobId;
pub use record::{ErrorKind, StageResult, TaskError, TaskOutcome, TaskRecord, TaskState};
pub use stage::{
    ClusterMethod, ClusterParams, DetectParams, DockingParams, ExpectedOutput, ExtractParams,
    Stage, StageParams,
};
