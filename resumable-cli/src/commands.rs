//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::Family;
use resumable_core::persistence::{self, CheckpointHeader};
use resumable_core::preemption::{InstallStatus, PreemptionHandler, SchedulerEnv};
use resumable_core::toy::{self, MemoryLogger, MomentumSgd, StepLr, ToyModel};
use resumable_core::{
    CheckpointCodec, CheckpointConfig, CheckpointRecord, CheckpointStore, EarlyStopping,
    ModelCheckpoint, MonitorMode, Policy, ProcessGroup, RestoreOrchestrator, RestoreSource,
    SingleProcess, StateValue, TrainerState,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Inspect { file, json } => handle_inspect(&file, json),
        Commands::Latest { dir, family } => handle_latest(dir, family, workspace),
        Commands::Config { action } => {
            handle_config(action.unwrap_or(ConfigAction::Show), workspace)
        }
        Commands::Demo {
            epochs,
            batches,
            params,
            batch_delay_ms,
        } => {
            handle_demo(
                workspace,
                epochs,
                batches,
                params,
                Duration::from_millis(batch_delay_ms),
            )
            .await
        }
    }
}

/// Load configuration and anchor relative paths at the workspace.
fn load_workspace_config(workspace: &Path) -> anyhow::Result<CheckpointConfig> {
    let mut config = resumable_core::load_config(Some(workspace), None)?;
    resolve_paths(&mut config, workspace);
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

fn resolve_paths(config: &mut CheckpointConfig, workspace: &Path) {
    if config.weights_save_path.is_relative() {
        config.weights_save_path = workspace.join(&config.weights_save_path);
    }
    if let Some(resume) = &config.resume_from_checkpoint {
        if resume.is_relative() {
            config.resume_from_checkpoint = Some(workspace.join(resume));
        }
    }
}

fn handle_inspect(file: &Path, json: bool) -> anyhow::Result<()> {
    let header = persistence::read_header(file)?;
    let record = persistence::load_record(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{}", summarize(file, &header, &record));
    }
    Ok(())
}

fn summarize(path: &Path, header: &CheckpointHeader, record: &CheckpointRecord) -> String {
    let parameters: usize = record
        .model_state
        .values()
        .filter_map(StateValue::as_tensor)
        .map(|t| t.data.len())
        .sum();
    let short_sha = header.sha256.get(..12).unwrap_or(&header.sha256);

    let mut lines = vec![
        format!("Checkpoint:      {}", path.display()),
        format!(
            "Format:          v{} ({} bytes, sha256 {})",
            header.format_version, header.payload_bytes, short_sha
        ),
        format!("Created:         {}", header.created_at.to_rfc3339()),
        format!(
            "Resume at:       epoch {}, step {}",
            record.epoch, record.global_step
        ),
    ];
    if let Some(best) = record.checkpoint_best_score {
        lines.push(format!("Best score:      {}", best));
    }
    if let (Some(wait), Some(patience)) = (record.early_stop_wait, record.early_stop_patience) {
        lines.push(format!(
            "Early stopping:  {}/{} evaluations without improvement",
            wait, patience
        ));
    }
    lines.push(format!("Optimizers:      {}", record.optimizer_states.len()));
    lines.push(format!("Schedulers:      {}", record.scheduler_states.len()));
    lines.push(format!(
        "Model:           {} entries, {} parameters",
        record.model_state.len(),
        parameters
    ));
    lines.push(match &record.hyperparameters {
        Some(hparams) => format!("Hyperparameters: {}", hparams),
        None => "Hyperparameters: none".to_string(),
    });
    if !record.extension.is_empty() {
        let keys: Vec<&str> = record.extension.keys().map(String::as_str).collect();
        lines.push(format!("Extension:       {}", keys.join(", ")));
    }
    lines.join("\n")
}

fn handle_latest(dir: Option<PathBuf>, family: Family, workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let dir = dir.unwrap_or_else(|| config.weights_save_path.clone());
    let family = match family {
        Family::Hpc => config.families.hpc(),
        Family::Regular => config.families.regular(),
    };

    let store = CheckpointStore::new(&dir);
    match store.latest(&family)? {
        Some(path) => println!("{}\t{}", store.max_index(&family)?, path.display()),
        None => println!(
            "No '{}' checkpoints in {}",
            family.prefix,
            dir.display()
        ),
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_workspace_config(workspace)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Init => {
            let config_dir = workspace.join(".resumable");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&CheckpointConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
    }
}

fn lock(state: &Mutex<TrainerState>) -> anyhow::Result<MutexGuard<'_, TrainerState>> {
    state
        .lock()
        .map_err(|_| anyhow::anyhow!("trainer state lock poisoned"))
}

fn demo_trainer(params: usize, batches: u64) -> TrainerState {
    let model = ToyModel::new(params).with_hyperparameters(serde_json::json!({
        "params": params,
        "batches": batches,
        "lr": 0.05,
        "momentum": 0.9,
    }));
    TrainerState::new(Box::new(model))
        .with_optimizer(Box::new(MomentumSgd::new(0.05, 0.9, params)))
        .with_scheduler(Box::new(StepLr::new(0.05, 2, 0.5)))
        .with_logger(Box::new(MemoryLogger::new()))
        .with_checkpoint_policy(Policy::Active(ModelCheckpoint::new(
            "loss",
            MonitorMode::Min,
        )))
        .with_early_stopping(Policy::Active(EarlyStopping::new("loss", 3, 1e-6)))
        .with_batches(batches, None)
}

async fn handle_demo(
    workspace: &Path,
    epochs: u64,
    batches: u64,
    params: usize,
    batch_delay: Duration,
) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let group: Arc<dyn ProcessGroup> = Arc::new(SingleProcess::from_config(&config.distributed));
    let codec = CheckpointCodec::new(config.state_count_policy);
    let store = CheckpointStore::new(&config.weights_save_path);
    let regular = config.families.regular();

    let mut state = demo_trainer(params, batches);
    let report = RestoreOrchestrator::from_config(&config, Arc::clone(&group)).restore(&mut state)?;
    match &report.source {
        RestoreSource::Hpc(path) => {
            println!("Resumed from preemption checkpoint {}", path.display())
        }
        RestoreSource::Explicit(path) => println!("Resumed from {}", path.display()),
        RestoreSource::None => println!("Starting a fresh run in {}", store.dir().display()),
    }
    for warning in &report.warnings {
        println!("Warning: {}", warning);
    }

    let state = Arc::new(Mutex::new(state));
    let handler = Arc::new(PreemptionHandler::new(
        &config,
        SchedulerEnv::from_process_env(&config.cluster),
        Arc::clone(&state),
        Arc::clone(&group),
    ));
    match Arc::clone(&handler).install()? {
        InstallStatus::Installed => println!(
            "Preemption handler installed for job {}",
            handler.env().job_id.as_deref().unwrap_or("?")
        ),
        InstallStatus::NotManaged => {
            tracing::info!("Not running as a scheduler job; preemption handling disabled")
        }
        InstallStatus::AlreadyInstalled => {}
    }

    loop {
        let epoch = lock(&state)?.current_epoch;
        if epoch >= epochs {
            break;
        }

        let mut epoch_loss = 0.0;
        for _ in 0..batches {
            epoch_loss += toy::fit_batch(&mut *lock(&state)?, 0.0)?;
            tokio::time::sleep(batch_delay).await;
        }
        let loss = epoch_loss / batches.max(1) as f64;

        let stop = {
            let mut guard = lock(&state)?;
            if let Some(checkpoint) = guard.checkpoint_policy.active_mut() {
                if checkpoint.observe(loss) {
                    tracing::debug!(epoch, loss, "New best loss");
                }
            }
            let stop = guard
                .early_stopping
                .active_mut()
                .is_some_and(|early_stop| early_stop.observe(loss));
            toy::step_schedulers(&mut guard)?;
            if group.is_leader() {
                let path = codec.save_next(&guard, &store, &regular)?;
                tracing::debug!(path = %path.display(), "Saved epoch checkpoint");
            }
            guard.current_epoch += 1;
            stop
        };

        println!("epoch {:>3}  loss {:.6}", epoch, loss);
        if stop {
            println!("Early stopping after epoch {}", epoch);
            break;
        }
    }

    let mut guard = lock(&state)?;
    if let Some(logger) = guard.logger.as_mut() {
        logger.close()?;
    }
    println!(
        "Finished at epoch {}, step {}",
        guard.current_epoch, guard.global_step
    );
    Ok(())
}
