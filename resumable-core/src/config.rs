//! Configuration for checkpointing and recovery.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/resumable/config.toml` and/or
//! `.resumable/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CheckpointError, Result};
use crate::state::Device;
use crate::store::CheckpointFamily;

/// Top-level checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding preemption (HPC) and regular checkpoints.
    pub weights_save_path: PathBuf,
    /// Explicit checkpoint to resume from when no HPC checkpoint exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_checkpoint: Option<PathBuf>,
    /// Device restored state is placed on.
    pub device: Device,
    /// How restore treats optimizer/scheduler count differences.
    pub state_count_policy: StateCountPolicy,
    pub distributed: DistributedConfig,
    pub cluster: ClusterConfig,
    pub families: FamilyConfig,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            weights_save_path: PathBuf::from("checkpoints"),
            resume_from_checkpoint: None,
            device: Device::Cpu,
            state_count_policy: StateCountPolicy::default(),
            distributed: DistributedConfig::default(),
            cluster: ClusterConfig::default(),
            families: FamilyConfig::default(),
        }
    }
}

impl CheckpointConfig {
    /// Validate this config and return any warnings.
    ///
    /// Returns an empty Vec if the config is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.families.validate();
        if self.distributed.world_size == 0 {
            warnings.push("distributed.world_size is 0; treating as a single process".into());
        } else if self.distributed.rank >= self.distributed.world_size {
            warnings.push(format!(
                "distributed.rank ({}) is not below world_size ({})",
                self.distributed.rank, self.distributed.world_size
            ));
        }
        if !self.cluster.requeue_command.contains("{job_id}") {
            warnings.push(format!(
                "cluster.requeue_command '{}' has no {{job_id}} placeholder",
                self.cluster.requeue_command
            ));
        }
        warnings
    }
}

/// Policy for restoring positional optimizer/scheduler state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateCountPolicy {
    /// Extra live objects beyond the stored list are left untouched; more
    /// stored states than live objects is an error.
    #[default]
    Lenient,
    /// Stored and live counts must match exactly.
    Strict,
}

/// How cooperating processes synchronize after a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributedMode {
    #[default]
    None,
    /// One process per device, collective barrier.
    Ddp,
    /// One process per node, collective barrier.
    Ddp2,
    /// Accelerator mesh with a named rendezvous.
    Tpu,
}

/// Process topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub mode: DistributedMode,
    /// This process's rank (0 is the leader).
    pub rank: usize,
    pub world_size: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            mode: DistributedMode::None,
            rank: 0,
            world_size: 1,
        }
    }
}

/// Workload scheduler integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Variable holding the job name; its presence gates signal handling.
    pub job_name_var: String,
    /// Variable holding the job id used for requeueing.
    pub job_id_var: String,
    /// Job names that indicate an interactive allocation.
    pub interactive_job_names: Vec<String>,
    /// Shell command that requeues the job; `{job_id}` is substituted.
    pub requeue_command: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            job_name_var: "SLURM_JOB_NAME".to_string(),
            job_id_var: "SLURM_JOB_ID".to_string(),
            interactive_job_names: vec!["bash".to_string()],
            requeue_command: "scontrol requeue {job_id}".to_string(),
        }
    }
}

/// File naming for the two checkpoint families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyConfig {
    pub hpc_prefix: String,
    pub regular_prefix: String,
    pub extension: String,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            hpc_prefix: CheckpointFamily::HPC_PREFIX.to_string(),
            regular_prefix: CheckpointFamily::REGULAR_PREFIX.to_string(),
            extension: CheckpointFamily::EXTENSION.to_string(),
        }
    }
}

impl FamilyConfig {
    pub fn hpc(&self) -> CheckpointFamily {
        CheckpointFamily::new(&self.hpc_prefix, &self.extension)
    }

    pub fn regular(&self) -> CheckpointFamily {
        CheckpointFamily::new(&self.regular_prefix, &self.extension)
    }

    /// The two prefixes must be non-empty and neither may contain the other,
    /// otherwise files of one family would be indexed as the other.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.hpc_prefix.is_empty() || self.regular_prefix.is_empty() {
            warnings.push("checkpoint family prefixes must not be empty".to_string());
        } else if self.hpc_prefix.contains(&self.regular_prefix)
            || self.regular_prefix.contains(&self.hpc_prefix)
        {
            warnings.push(format!(
                "checkpoint prefixes '{}' and '{}' overlap",
                self.hpc_prefix, self.regular_prefix
            ));
        }
        warnings
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RESUMABLE_`)
/// 3. Workspace-local config (`.resumable/config.toml`)
/// 4. User config (`~/.config/resumable/config.toml`)
/// 5. Built-in defaults
///
/// A source that cannot be parsed or holds an invalid value is reported as
/// [`CheckpointError::Config`].
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&CheckpointConfig>,
) -> Result<CheckpointConfig> {
    let mut figment = Figment::from(Serialized::defaults(CheckpointConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "resumable", "resumable") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".resumable").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // RESUMABLE_WEIGHTS_SAVE_PATH, RESUMABLE_DISTRIBUTED__RANK, etc.
    figment = figment.merge(Env::prefixed("RESUMABLE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment
        .extract()
        .map_err(|e| CheckpointError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CheckpointConfig::default();
        assert_eq!(config.weights_save_path, PathBuf::from("checkpoints"));
        assert!(config.resume_from_checkpoint.is_none());
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.state_count_policy, StateCountPolicy::Lenient);
        assert_eq!(config.distributed.mode, DistributedMode::None);
        assert_eq!(config.cluster.job_name_var, "SLURM_JOB_NAME");
        assert_eq!(config.families.hpc(), CheckpointFamily::hpc());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = CheckpointConfig::default();
        config.device = Device::Accelerator(1);
        config.resume_from_checkpoint = Some(PathBuf::from("/runs/a/run_ckpt_3.ckpt"));
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: CheckpointConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.device, Device::Accelerator(1));
        assert_eq!(
            deserialized.resume_from_checkpoint,
            config.resume_from_checkpoint
        );
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.families.extension, "ckpt");
        assert_eq!(config.distributed.world_size, 1);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = CheckpointConfig::default();
        overrides.weights_save_path = PathBuf::from("/scratch/ckpt");
        overrides.distributed.mode = DistributedMode::Ddp;
        overrides.distributed.world_size = 4;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.weights_save_path, PathBuf::from("/scratch/ckpt"));
        assert_eq!(config.distributed.mode, DistributedMode::Ddp);
        assert_eq!(config.distributed.world_size, 4);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".resumable");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            r#"
weights_save_path = "/scratch/run-7"
device = "accelerator:0"
state_count_policy = "strict"

[distributed]
mode = "ddp"
rank = 2
world_size = 8

[cluster]
requeue_command = "sbatch --requeue {job_id}"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.weights_save_path, PathBuf::from("/scratch/run-7"));
        assert_eq!(config.device, Device::Accelerator(0));
        assert_eq!(config.state_count_policy, StateCountPolicy::Strict);
        assert_eq!(config.distributed.rank, 2);
        assert_eq!(config.cluster.requeue_command, "sbatch --requeue {job_id}");
        // Unset sections keep their defaults.
        assert_eq!(config.cluster.job_id_var, "SLURM_JOB_ID");
    }

    #[test]
    fn test_invalid_workspace_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".resumable");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("config.toml"), "device = \"gpu:x\"\n").unwrap();

        let err = load_config(Some(dir.path()), None).unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = CheckpointConfig::default();
        config.families.regular_prefix = "ckpt_".into();
        config.distributed.rank = 3;
        config.distributed.world_size = 2;
        config.cluster.requeue_command = "scontrol requeue".into();

        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("overlap"));
    }
}
