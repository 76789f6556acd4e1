//! Collaborator seams: the model, optimizers, schedulers, metric logger, and
//! accelerator runtime the checkpoint layer orchestrates but does not own.

use serde_json::Value;

use crate::error::Result;
use crate::record::CheckpointRecord;
use crate::state::{Device, StateDict, Stateful};

/// Extension points a model can use to add or consume extra checkpoint fields.
///
/// Every hook defaults to a no-op.
pub trait CheckpointHooks {
    /// Called at the end of every dump, before the record is written.
    fn on_save_checkpoint(&self, _record: &mut CheckpointRecord) {}

    /// Called after a record has been applied to live state.
    fn on_load_checkpoint(&mut self, _record: &CheckpointRecord) {}

    /// Called after the dump of a preemption checkpoint, before it is written.
    fn on_hpc_save(&self, _record: &mut CheckpointRecord) {}

    /// Called after a preemption checkpoint has been restored.
    fn on_hpc_load(&mut self, _record: &CheckpointRecord) {}
}

/// The trainable model.
pub trait TrainableModel: Stateful + CheckpointHooks + Send {
    /// Move parameters to `device`.
    fn to_device(&mut self, device: Device);

    /// Hyperparameters to embed in checkpoints, if the model exposes any.
    ///
    /// Expected to be a JSON object; anything else is rejected when the record
    /// is written and the save is retried without hyperparameters.
    fn hyperparameters(&self) -> Option<Value> {
        None
    }
}

/// An optimizer with per-parameter state (momentum buffers, moment estimates).
pub trait Optimizer: Stateful + Send {
    /// Mutable access to each per-parameter state entry.
    fn state_entries_mut(&mut self) -> Vec<&mut StateDict>;
}

/// A learning-rate scheduler.
pub trait LrScheduler: Stateful + Send {}

/// Experiment metric logger.
pub trait MetricLogger: Send {
    /// Flush pending metrics to durable storage.
    fn save(&mut self) -> Result<()>;

    /// Flush and release the logger.
    fn close(&mut self) -> Result<()>;
}

/// Accelerator runtime hints.
pub trait Accelerator: Send + Sync {
    /// Release cached allocator memory.
    fn empty_cache(&self);
}

/// Used when training runs on CPU only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccelerator;

impl Accelerator for NoAccelerator {
    fn empty_cache(&self) {}
}
