//! Save-and-requeue in response to a scheduler preemption notice.
//!
//! Under a batch scheduler the job receives `SIGUSR1` some time before it is
//! killed. The leader process writes a preemption checkpoint, asks the
//! scheduler to requeue the job and flushes the metric logger. `SIGTERM`,
//! which often arrives alongside the notice, is logged and otherwise ignored
//! so it cannot interrupt the save.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::{CheckpointCodec, TrainerState};
use crate::config::{CheckpointConfig, ClusterConfig};
use crate::distributed::ProcessGroup;
use crate::error::{CheckpointError, Result};
use crate::store::{CheckpointFamily, CheckpointStore};

#[cfg(unix)]
static INSTALLED: InstallGuard = InstallGuard::new();

/// Records whether the signal handlers of this process have been registered.
#[cfg_attr(not(unix), allow(dead_code))]
struct InstallGuard(AtomicBool);

#[cfg_attr(not(unix), allow(dead_code))]
impl InstallGuard {
    const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Run `register` unless an earlier call succeeded. Returns `None` when
    /// already registered. A failed `register` leaves the guard unclaimed.
    fn claim<T>(&self, register: impl FnOnce() -> io::Result<T>) -> io::Result<Option<T>> {
        if self
            .0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        match register() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.0.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Scheduler variables captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerEnv {
    pub job_name: Option<String>,
    pub job_id: Option<String>,
    interactive_job_names: Vec<String>,
}

impl SchedulerEnv {
    /// Read the variables named in `cluster` through `lookup`.
    pub fn capture(cluster: &ClusterConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            job_name: lookup(&cluster.job_name_var),
            job_id: lookup(&cluster.job_id_var),
            interactive_job_names: cluster.interactive_job_names.clone(),
        }
    }

    /// Read the variables from the process environment.
    pub fn from_process_env(cluster: &ClusterConfig) -> Self {
        Self::capture(cluster, |name| std::env::var(name).ok())
    }

    /// Whether the process runs as a non-interactive scheduler job.
    pub fn is_managed(&self) -> bool {
        match &self.job_name {
            Some(name) => !self.interactive_job_names.iter().any(|n| n == name),
            None => false,
        }
    }
}

/// What a preemption notice led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreemptOutcome {
    /// This process is not the leader; nothing was done.
    NotLeader,
    /// A checkpoint was written; `requeued` reports the requeue command result.
    Saved { path: PathBuf, requeued: bool },
}

/// Result of [`PreemptionHandler::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    Installed,
    /// Not running as a scheduler job; no handlers registered.
    NotManaged,
    /// Handlers were already registered earlier in this process.
    AlreadyInstalled,
}

/// Writes preemption checkpoints for a shared [`TrainerState`].
pub struct PreemptionHandler {
    state: Arc<Mutex<TrainerState>>,
    codec: CheckpointCodec,
    store: CheckpointStore,
    family: CheckpointFamily,
    requeue_command: String,
    env: SchedulerEnv,
    group: Arc<dyn ProcessGroup>,
}

impl PreemptionHandler {
    pub fn new(
        config: &CheckpointConfig,
        env: SchedulerEnv,
        state: Arc<Mutex<TrainerState>>,
        group: Arc<dyn ProcessGroup>,
    ) -> Self {
        Self {
            state,
            codec: CheckpointCodec::new(config.state_count_policy),
            store: CheckpointStore::new(&config.weights_save_path),
            family: config.families.hpc(),
            requeue_command: config.cluster.requeue_command.clone(),
            env,
            group,
        }
    }

    pub fn env(&self) -> &SchedulerEnv {
        &self.env
    }

    /// Register the signal handlers for the rest of the process lifetime.
    ///
    /// Does nothing outside a scheduler job. Must be called from within a
    /// tokio runtime.
    #[cfg(unix)]
    pub fn install(self: Arc<Self>) -> Result<InstallStatus> {
        use tokio::signal::unix::{SignalKind, signal};

        if !self.env.is_managed() {
            tracing::debug!(
                job_name = ?self.env.job_name,
                "Not a scheduler job; preemption handler not installed"
            );
            return Ok(InstallStatus::NotManaged);
        }
        // Both streams exist before this returns, so a signal raised right
        // after install is queued rather than killing the process.
        let streams = INSTALLED.claim(|| {
            Ok((
                signal(SignalKind::user_defined1())?,
                signal(SignalKind::terminate())?,
            ))
        })?;
        let Some((mut preempt, mut terminate)) = streams else {
            return Ok(InstallStatus::AlreadyInstalled);
        };

        let handler = Arc::clone(&self);
        tokio::spawn(async move {
            while preempt.recv().await.is_some() {
                tracing::warn!("Received preemption signal");
                match handler.on_preempt().await {
                    Ok(outcome) => tracing::info!(?outcome, "Preemption handled"),
                    Err(e) => tracing::error!(error = %e, "Preemption checkpoint failed"),
                }
            }
        });
        tokio::spawn(async move {
            while terminate.recv().await.is_some() {
                tracing::info!("Bypassing termination signal");
            }
        });

        tracing::info!(
            job_name = ?self.env.job_name,
            job_id = ?self.env.job_id,
            "Preemption handler installed"
        );
        Ok(InstallStatus::Installed)
    }

    #[cfg(not(unix))]
    pub fn install(self: Arc<Self>) -> Result<InstallStatus> {
        tracing::warn!("Preemption signals are not supported on this platform");
        Ok(InstallStatus::NotManaged)
    }

    /// Save a preemption checkpoint and requeue the job, on the leader only.
    ///
    /// A failed requeue is logged and reported in the outcome, never returned
    /// as an error: the checkpoint is already on disk.
    pub async fn on_preempt(&self) -> Result<PreemptOutcome> {
        if !self.group.is_leader() {
            tracing::debug!(rank = self.group.rank(), "Not the leader; skipping preemption save");
            return Ok(PreemptOutcome::NotLeader);
        }

        let path = {
            let mut state = self.lock_state()?;
            self.codec.hpc_save(&mut state, &self.store, &self.family)?
        };

        let requeued = self.requeue().await;

        {
            let mut state = self.lock_state()?;
            if let Some(logger) = state.logger.as_mut() {
                if let Err(e) = logger.close() {
                    tracing::warn!(error = %e, "Failed to close metric logger");
                }
            }
        }

        Ok(PreemptOutcome::Saved { path, requeued })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, TrainerState>> {
        self.state
            .lock()
            .map_err(|_| CheckpointError::collaborator("trainer", "state lock poisoned"))
    }

    async fn requeue(&self) -> bool {
        let Some(job_id) = self.env.job_id.as_deref() else {
            tracing::warn!("No job id in the environment; not requeueing");
            return false;
        };
        let command = self.requeue_command.replace("{job_id}", job_id);
        tracing::info!(job_id, command = %command, "Requeueing job");

        let result = tokio::process::Command::new("sh")
            .args(["-c", &command])
            .output()
            .await;
        let message = match result {
            Ok(output) if output.status.success() => {
                tracing::info!(job_id, "Requeue succeeded");
                return true;
            }
            Ok(output) => format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => e.to_string(),
        };

        let err = CheckpointError::Requeue {
            job_id: job_id.to_string(),
            message,
        };
        tracing::error!(error = %err, "Requeue failed");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::SingleProcess;
    use crate::toy::{self, MemoryLogger};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_with(vars: &[(&str, &str)]) -> SchedulerEnv {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SchedulerEnv::capture(&ClusterConfig::default(), |name| vars.get(name).cloned())
    }

    fn handler(
        dir: &TempDir,
        requeue_command: &str,
        rank: usize,
    ) -> (PreemptionHandler, Arc<toy::LoggerStats>) {
        let mut config = CheckpointConfig {
            weights_save_path: dir.path().join("ckpts"),
            ..CheckpointConfig::default()
        };
        config.cluster.requeue_command = requeue_command.to_string();

        let logger = MemoryLogger::new();
        let stats = logger.stats();
        let state = toy::toy_trainer(3, 10).with_logger(Box::new(logger));
        let env = env_with(&[("SLURM_JOB_NAME", "train"), ("SLURM_JOB_ID", "4242")]);
        let handler = PreemptionHandler::new(
            &config,
            env,
            Arc::new(Mutex::new(state)),
            Arc::new(SingleProcess::with_rank(rank)),
        );
        (handler, stats)
    }

    #[test]
    fn test_scheduler_env_gating() {
        assert!(!env_with(&[]).is_managed());
        assert!(!env_with(&[("SLURM_JOB_NAME", "bash")]).is_managed());
        let env = env_with(&[("SLURM_JOB_NAME", "train"), ("SLURM_JOB_ID", "17")]);
        assert!(env.is_managed());
        assert_eq!(env.job_id.as_deref(), Some("17"));
    }

    #[test]
    fn test_failed_registration_can_be_retried() {
        let guard = InstallGuard::new();
        let failed = guard.claim(|| Err::<(), _>(io::Error::other("no signal driver")));
        assert!(failed.is_err());

        assert_eq!(guard.claim(|| Ok(7)).unwrap(), Some(7));
        assert_eq!(guard.claim(|| Ok(8)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_outside_scheduler_is_noop() {
        let dir = TempDir::new().unwrap();
        let config = CheckpointConfig {
            weights_save_path: dir.path().to_path_buf(),
            ..CheckpointConfig::default()
        };
        let handler = Arc::new(PreemptionHandler::new(
            &config,
            env_with(&[("SLURM_JOB_NAME", "bash")]),
            Arc::new(Mutex::new(toy::toy_trainer(2, 0))),
            Arc::new(SingleProcess::new()),
        ));
        assert_eq!(handler.install().unwrap(), InstallStatus::NotManaged);
    }

    #[tokio::test]
    async fn test_non_leader_does_nothing() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("requeued");
        let (handler, stats) = handler(&dir, &format!("touch {}", marker.display()), 1);

        let outcome = handler.on_preempt().await.unwrap();
        assert_eq!(outcome, PreemptOutcome::NotLeader);
        assert!(!dir.path().join("ckpts").exists());
        assert!(!marker.exists());
        assert_eq!(stats.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_leader_saves_next_index_and_requeues() {
        let dir = TempDir::new().unwrap();
        let ckpts = dir.path().join("ckpts");
        std::fs::create_dir_all(&ckpts).unwrap();
        std::fs::write(ckpts.join("hpc_ckpt_3.ckpt"), b"old").unwrap();
        let marker = dir.path().join("requeued");
        let (handler, stats) = handler(
            &dir,
            &format!("echo {{job_id}} > {}", marker.display()),
            0,
        );

        let outcome = handler.on_preempt().await.unwrap();
        assert_eq!(
            outcome,
            PreemptOutcome::Saved {
                path: ckpts.join("hpc_ckpt_4.ckpt"),
                requeued: true
            }
        );
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "4242");
        assert_eq!(std::fs::read_dir(&ckpts).unwrap().count(), 2);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_requeue_failure_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let (handler, stats) = handler(&dir, "exit 3", 0);

        let outcome = handler.on_preempt().await.unwrap();
        match outcome {
            PreemptOutcome::Saved { path, requeued } => {
                assert!(path.exists());
                assert!(!requeued);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_job_id_skips_requeue() {
        let dir = TempDir::new().unwrap();
        let config = CheckpointConfig {
            weights_save_path: dir.path().to_path_buf(),
            ..CheckpointConfig::default()
        };
        let handler = PreemptionHandler::new(
            &config,
            env_with(&[("SLURM_JOB_NAME", "train")]),
            Arc::new(Mutex::new(toy::toy_trainer(2, 0))),
            Arc::new(SingleProcess::new()),
        );
        let outcome = handler.on_preempt().await.unwrap();
        assert!(matches!(
            outcome,
            PreemptOutcome::Saved {
                requeued: false,
                ..
            }
        ));
    }
}
