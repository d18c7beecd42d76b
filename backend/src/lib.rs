// 现场总线轮询后端
// Polls Modbus field devices on a schedule, normalizes readings, persists one row per time bucket

pub mod config;
pub mod decode;
pub mod devices;
pub mod drivers;
pub mod error;
pub mod guard;
pub mod normalizer;
pub mod orchestrator;
pub mod poll_core;
pub mod trigger;
pub mod types;

pub use config::AppConfig;
pub use devices::{DecodeKind, DeviceEndpoint, DeviceReader, DeviceRegistry, RegisterSpec};
pub use guard::{CycleState, Rejection, TickGuard};
pub use normalizer::{ActivePowerPolicy, FieldRule, FieldSpec, LevelTransform, Normalizer};
pub use orchestrator::{CycleReport, ReadingOrchestrator};
pub use poll_core::{PollController, PollJob, TickOutcome};
pub use types::{FieldValue, Granularity, RawValue, Reading, ReadingResult, TimeBucket, ValidatedRow};
