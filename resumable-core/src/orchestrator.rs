//! Startup restore: picks the checkpoint to resume from, applies it, and
//! holds every process until all of them have finished loading.
//!
//! Precedence is fixed:
//!
//! 1. the latest preemption (HPC) checkpoint in the weights directory,
//! 2. an explicitly configured resume path,
//! 3. nothing (fresh start).
//!
//! A checkpoint that exists but cannot be read is a fatal error; there is no
//! fallback to the next source.

use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::{CheckpointCodec, RestoreWarning, TrainerState};
use crate::components::{Accelerator, NoAccelerator};
use crate::config::{CheckpointConfig, DistributedMode};
use crate::distributed::{self, ProcessGroup};
use crate::error::Result;
use crate::state::Device;
use crate::store::{CheckpointFamily, CheckpointStore};

const RESTORE_RENDEZVOUS: &str = "restore_checkpoint";

/// Where restored state came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Hpc(PathBuf),
    Explicit(PathBuf),
    None,
}

impl RestoreSource {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            RestoreSource::Hpc(path) | RestoreSource::Explicit(path) => Some(path),
            RestoreSource::None => None,
        }
    }
}

/// Outcome of a startup restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub source: RestoreSource,
    pub warnings: Vec<RestoreWarning>,
}

/// Drives the startup restore sequence.
pub struct RestoreOrchestrator {
    codec: CheckpointCodec,
    store: CheckpointStore,
    hpc_family: CheckpointFamily,
    resume_from: Option<PathBuf>,
    device: Device,
    mode: DistributedMode,
    accelerator: Arc<dyn Accelerator>,
    group: Arc<dyn ProcessGroup>,
}

impl RestoreOrchestrator {
    pub fn from_config(config: &CheckpointConfig, group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            codec: CheckpointCodec::new(config.state_count_policy),
            store: CheckpointStore::new(&config.weights_save_path),
            hpc_family: config.families.hpc(),
            resume_from: config.resume_from_checkpoint.clone(),
            device: config.device,
            mode: config.distributed.mode,
            accelerator: Arc::new(NoAccelerator),
            group,
        }
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Restore `state` from the highest-precedence checkpoint available, then
    /// synchronize with the other processes.
    pub fn restore(&self, state: &mut TrainerState) -> Result<RestoreReport> {
        self.accelerator.empty_cache();
        let hpc = self.restore_hpc(state)?;
        self.accelerator.empty_cache();

        let (source, warnings) = match hpc {
            Some(restored) => restored,
            None => self.restore_explicit(state)?,
        };

        distributed::synchronize(self.mode, self.group.as_ref(), RESTORE_RENDEZVOUS)?;
        self.accelerator.empty_cache();

        Ok(RestoreReport { source, warnings })
    }

    fn restore_hpc(
        &self,
        state: &mut TrainerState,
    ) -> Result<Option<(RestoreSource, Vec<RestoreWarning>)>> {
        let Some(path) = self.store.latest(&self.hpc_family)? else {
            return Ok(None);
        };
        let warnings = self.codec.hpc_load(state, &path, self.device)?;
        tracing::info!(
            path = %path.display(),
            epoch = state.current_epoch,
            step = state.global_step,
            "Restored from preemption checkpoint"
        );
        Ok(Some((RestoreSource::Hpc(path), warnings)))
    }

    fn restore_explicit(
        &self,
        state: &mut TrainerState,
    ) -> Result<(RestoreSource, Vec<RestoreWarning>)> {
        let Some(path) = &self.resume_from else {
            tracing::debug!(dir = %self.store.dir().display(), "No checkpoint to restore");
            return Ok((RestoreSource::None, Vec::new()));
        };
        let warnings = self.codec.load_checkpoint(state, path, self.device)?;
        tracing::info!(
            path = %path.display(),
            epoch = state.current_epoch,
            "Restored from configured checkpoint"
        );
        Ok((RestoreSource::Explicit(path.clone()), warnings))
    }
}
