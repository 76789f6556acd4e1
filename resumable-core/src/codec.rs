//! Building checkpoint records from live trainer state and applying them back.

use std::path::{Path, PathBuf};

use crate::components::{LrScheduler, MetricLogger, Optimizer, TrainableModel};
use crate::config::StateCountPolicy;
use crate::error::{CheckpointError, Result, StateKind};
use crate::persistence;
use crate::policy::{EarlyStopping, ModelCheckpoint, Policy};
use crate::record::CheckpointRecord;
use crate::state::{Device, move_entry_tensors};
use crate::store::{CheckpointFamily, CheckpointStore};

/// Everything a checkpoint captures, plus the collaborators that own it.
pub struct TrainerState {
    pub model: Box<dyn TrainableModel>,
    pub optimizers: Vec<Box<dyn Optimizer>>,
    pub schedulers: Vec<Box<dyn LrScheduler>>,
    /// Epoch currently running (0-based).
    pub current_epoch: u64,
    /// Optimizer steps taken so far.
    pub global_step: u64,
    pub checkpoint_policy: Policy<ModelCheckpoint>,
    pub early_stopping: Policy<EarlyStopping>,
    pub num_training_batches: u64,
    /// Batches per optimizer step; unset means 1.
    pub accumulate_grad_batches: Option<u32>,
    pub logger: Option<Box<dyn MetricLogger>>,
}

impl TrainerState {
    pub fn new(model: Box<dyn TrainableModel>) -> Self {
        Self {
            model,
            optimizers: Vec::new(),
            schedulers: Vec::new(),
            current_epoch: 0,
            global_step: 0,
            checkpoint_policy: Policy::Absent,
            early_stopping: Policy::Absent,
            num_training_batches: 0,
            accumulate_grad_batches: None,
            logger: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizers.push(optimizer);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn LrScheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: Policy<ModelCheckpoint>) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    pub fn with_early_stopping(mut self, policy: Policy<EarlyStopping>) -> Self {
        self.early_stopping = policy;
        self
    }

    pub fn with_batches(mut self, num_training_batches: u64, accumulate: Option<u32>) -> Self {
        self.num_training_batches = num_training_batches;
        self.accumulate_grad_batches = accumulate;
        self
    }

    /// Optimizer steps in one full epoch.
    pub fn expected_steps(&self) -> f64 {
        let accumulate = self.accumulate_grad_batches.unwrap_or(1).max(1);
        self.num_training_batches as f64 / f64::from(accumulate)
    }
}

impl std::fmt::Debug for TrainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerState")
            .field("current_epoch", &self.current_epoch)
            .field("global_step", &self.global_step)
            .field("optimizers", &self.optimizers.len())
            .field("schedulers", &self.schedulers.len())
            .field("checkpoint_policy", &self.checkpoint_policy)
            .field("early_stopping", &self.early_stopping)
            .finish_non_exhaustive()
    }
}

/// A non-fatal condition found while restoring.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreWarning {
    /// The checkpoint was written part-way through an epoch; continuing from
    /// it may not reproduce an uninterrupted run.
    MidEpoch { global_step: u64, expected_steps: f64 },
}

impl std::fmt::Display for RestoreWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreWarning::MidEpoch {
                global_step,
                expected_steps,
            } => write!(
                f,
                "checkpoint at step {global_step} was saved mid-epoch \
                 ({expected_steps} steps per epoch); resumed training may be unreliable"
            ),
        }
    }
}

/// Converts between live trainer state and [`CheckpointRecord`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointCodec {
    count_policy: StateCountPolicy,
}

impl CheckpointCodec {
    pub fn new(count_policy: StateCountPolicy) -> Self {
        Self { count_policy }
    }

    pub fn count_policy(&self) -> StateCountPolicy {
        self.count_policy
    }

    /// Snapshot `state` into a new record.
    ///
    /// Counters are stored one past their current values so that they name the
    /// epoch and step to resume at.
    pub fn dump(&self, state: &TrainerState) -> CheckpointRecord {
        let mut record = CheckpointRecord::new(
            state.current_epoch + 1,
            state.global_step + 1,
            state.model.state_dict(),
        );

        if let Some(checkpoint) = state.checkpoint_policy.active() {
            record.checkpoint_best_score = Some(checkpoint.best);
        }
        if let Some(early_stop) = state.early_stopping.active() {
            record.early_stop_wait = Some(early_stop.wait);
            record.early_stop_patience = Some(early_stop.patience);
        }

        record.optimizer_states = state.optimizers.iter().map(|o| o.state_dict()).collect();
        record.scheduler_states = state.schedulers.iter().map(|s| s.state_dict()).collect();

        match state.model.hyperparameters() {
            Some(hparams) => record.hyperparameters = Some(hparams),
            None => tracing::warn!(
                "Model exposes no hyperparameters; they will not be saved in the checkpoint"
            ),
        }

        state.model.on_save_checkpoint(&mut record);
        record
    }

    /// Apply `record`, read from `path`, onto `state`.
    ///
    /// Tensors in the record are decoded on the CPU; when `device` is an
    /// accelerator the model and every optimizer state entry are moved there
    /// afterwards.
    pub fn restore(
        &self,
        state: &mut TrainerState,
        record: &CheckpointRecord,
        path: &Path,
        device: Device,
    ) -> Result<Vec<RestoreWarning>> {
        let mut warnings = Vec::new();

        state.model.load_state_dict(&record.model_state)?;
        if device.is_accelerator() {
            state.model.to_device(device);
        }

        state.current_epoch = record.epoch;
        state.global_step = record.global_step;

        if let Some(checkpoint) = state.checkpoint_policy.active_mut() {
            checkpoint.best = record
                .checkpoint_best_score
                .ok_or_else(|| CheckpointError::missing_field("checkpoint_best_score", path))?;
        }
        if let Some(early_stop) = state.early_stopping.active_mut() {
            early_stop.wait = record
                .early_stop_wait
                .ok_or_else(|| CheckpointError::missing_field("early_stop_wait", path))?;
            early_stop.patience = record
                .early_stop_patience
                .ok_or_else(|| CheckpointError::missing_field("early_stop_patience", path))?;
        }

        let expected_steps = state.expected_steps();
        if expected_steps > 0.0 && (record.global_step as f64) % expected_steps > 1.0 {
            let warning = RestoreWarning::MidEpoch {
                global_step: record.global_step,
                expected_steps,
            };
            tracing::warn!(path = %path.display(), "{warning}");
            warnings.push(warning);
        }

        self.check_count(
            StateKind::Optimizer,
            record.optimizer_states.len(),
            state.optimizers.len(),
        )?;
        self.check_count(
            StateKind::Scheduler,
            record.scheduler_states.len(),
            state.schedulers.len(),
        )?;

        for (optimizer, stored) in state.optimizers.iter_mut().zip(&record.optimizer_states) {
            optimizer.load_state_dict(stored)?;
            if device.is_accelerator() {
                // One entry at a time keeps peak accelerator memory bounded.
                for entry in optimizer.state_entries_mut() {
                    move_entry_tensors(entry, device);
                }
            }
        }
        for (scheduler, stored) in state.schedulers.iter_mut().zip(&record.scheduler_states) {
            scheduler.load_state_dict(stored)?;
        }

        state.model.on_load_checkpoint(record);
        Ok(warnings)
    }

    fn check_count(&self, kind: StateKind, stored: usize, live: usize) -> Result<()> {
        let ok = match self.count_policy {
            StateCountPolicy::Lenient => stored <= live,
            StateCountPolicy::Strict => stored == live,
        };
        if !ok {
            return Err(CheckpointError::StateCountMismatch { kind, stored, live });
        }
        if stored < live {
            tracing::debug!(%kind, stored, live, "Leaving extra live state untouched");
        }
        Ok(())
    }

    /// Dump `state` and write it to `path`.
    pub fn save_checkpoint(&self, state: &TrainerState, path: &Path) -> Result<()> {
        let mut record = self.dump(state);
        persistence::save_record(&mut record, path)?;
        tracing::info!(path = %path.display(), epoch = record.epoch, "Saved checkpoint");
        Ok(())
    }

    /// Save the next checkpoint of `family` into `store`, returning its path.
    pub fn save_next(
        &self,
        state: &TrainerState,
        store: &CheckpointStore,
        family: &CheckpointFamily,
    ) -> Result<PathBuf> {
        store.ensure_dir()?;
        let path = store.path_for_next(family)?;
        self.save_checkpoint(state, &path)?;
        Ok(path)
    }

    /// Write a preemption checkpoint with the next index of `family`.
    ///
    /// Pending metrics are flushed first; a flush failure is logged and the
    /// checkpoint is still written.
    pub fn hpc_save(
        &self,
        state: &mut TrainerState,
        store: &CheckpointStore,
        family: &CheckpointFamily,
    ) -> Result<PathBuf> {
        store.ensure_dir()?;

        if let Some(logger) = state.logger.as_mut() {
            if let Err(e) = logger.save() {
                tracing::warn!(error = %e, "Failed to flush metric logger before preemption save");
            }
        }

        let path = store.path_for_next(family)?;
        let mut record = self.dump(state);
        state.model.on_hpc_save(&mut record);
        persistence::save_record(&mut record, &path)?;
        tracing::info!(
            path = %path.display(),
            step = record.global_step,
            "Saved preemption checkpoint"
        );
        Ok(path)
    }

    /// Load and apply the checkpoint at `path`.
    pub fn load_checkpoint(
        &self,
        state: &mut TrainerState,
        path: &Path,
        device: Device,
    ) -> Result<Vec<RestoreWarning>> {
        let record = persistence::load_record(path)?;
        self.restore(state, &record, path, device)
    }

    /// Load a preemption checkpoint and run the model's preemption hook.
    pub fn hpc_load(
        &self,
        state: &mut TrainerState,
        path: &Path,
        device: Device,
    ) -> Result<Vec<RestoreWarning>> {
        let record = persistence::load_record(path)?;
        let warnings = self.restore(state, &record, path, device)?;
        state.model.on_hpc_load(&record);
        Ok(warnings)
    }
}
