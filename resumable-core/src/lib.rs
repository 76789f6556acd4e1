//! # Resumable Core
//!
//! Checkpoint and recovery for long-running, preemptible training jobs.
//! Provides atomic checkpoint persistence, the checkpoint codec, numbered
//! checkpoint directories, the startup restore sequence, and the
//! signal-driven preemption handler.

pub mod codec;
pub mod components;
pub mod config;
pub mod distributed;
pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod preemption;
pub mod record;
pub mod state;
pub mod store;
pub mod toy;

// Re-export commonly used types at the crate root.
pub use codec::{CheckpointCodec, RestoreWarning, TrainerState};
pub use components::{
    Accelerator, CheckpointHooks, LrScheduler, MetricLogger, NoAccelerator, Optimizer,
    TrainableModel,
};
pub use config::{CheckpointConfig, DistributedMode, StateCountPolicy, load_config};
pub use distributed::{ProcessGroup, SingleProcess, ThreadGroup};
pub use error::{CheckpointError, Result};
pub use orchestrator::{RestoreOrchestrator, RestoreReport, RestoreSource};
pub use persistence::{atomic_save, load_record, save_record};
pub use policy::{EarlyStopping, ModelCheckpoint, MonitorMode, Policy};
pub use preemption::{InstallStatus, PreemptOutcome, PreemptionHandler, SchedulerEnv};
pub use record::CheckpointRecord;
pub use state::{Device, StateDict, StateValue, Stateful, Tensor};
pub use store::{CheckpointFamily, CheckpointStore};
