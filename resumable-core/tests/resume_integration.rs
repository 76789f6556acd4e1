//! End-to-end checkpoint and resume tests over the toy trainer.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use resumable_core::preemption::{PreemptOutcome, PreemptionHandler, SchedulerEnv};
use resumable_core::toy::{self, MemoryLogger};
use resumable_core::{
    CheckpointCodec, CheckpointConfig, CheckpointFamily, CheckpointStore, EarlyStopping,
    Policy, RestoreOrchestrator, RestoreSource, SingleProcess, StateCountPolicy, TrainerState,
};

const PARAMS: usize = 5;
const BATCHES: u64 = 8;

fn config(dir: &TempDir) -> CheckpointConfig {
    let mut config = CheckpointConfig {
        weights_save_path: dir.path().join("weights"),
        ..CheckpointConfig::default()
    };
    config.cluster.requeue_command = "true".to_string();
    config
}

fn trainer() -> TrainerState {
    toy::toy_trainer(PARAMS, BATCHES)
        .with_early_stopping(Policy::Active(EarlyStopping::new("loss", 100, 0.0)))
}

fn run_epoch(state: &mut TrainerState) {
    for _ in 0..BATCHES {
        let loss = toy::fit_batch(state, 0.25).unwrap();
        if let Some(early_stop) = state.early_stopping.active_mut() {
            early_stop.observe(loss);
        }
    }
    toy::step_schedulers(state).unwrap();
    state.current_epoch += 1;
}

#[test]
fn test_resumed_run_matches_uninterrupted_run() {
    let mut uninterrupted = trainer();
    for _ in 0..4 {
        run_epoch(&mut uninterrupted);
    }

    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let codec = CheckpointCodec::new(config.state_count_policy);
    let store = CheckpointStore::new(&config.weights_save_path);

    let mut first = trainer();
    run_epoch(&mut first);
    run_epoch(&mut first);
    let saved = codec
        .save_next(&first, &store, &config.families.regular())
        .unwrap();
    drop(first);

    let mut resumed = trainer();
    let mut restore_config = config.clone();
    restore_config.resume_from_checkpoint = Some(saved.clone());
    let report = RestoreOrchestrator::from_config(&restore_config, Arc::new(SingleProcess::new()))
        .restore(&mut resumed)
        .unwrap();
    assert_eq!(report.source, RestoreSource::Explicit(saved));
    assert!(report.warnings.is_empty());

    // Resume-at counters: the epoch after the two completed ones.
    assert_eq!(resumed.current_epoch, 3);
    resumed.current_epoch -= 1;
    run_epoch(&mut resumed);
    run_epoch(&mut resumed);

    assert_eq!(
        resumed.model.state_dict(),
        uninterrupted.model.state_dict()
    );
    assert_eq!(
        resumed.optimizers[0].state_dict(),
        uninterrupted.optimizers[0].state_dict()
    );
    assert_eq!(
        resumed.schedulers[0].state_dict(),
        uninterrupted.schedulers[0].state_dict()
    );
    assert_eq!(
        resumed.early_stopping.active().map(|e| e.patience),
        Some(100)
    );
}

#[tokio::test]
async fn test_preempt_then_restart_restores_hpc_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let env = SchedulerEnv::capture(&config.cluster, |name| match name {
        "SLURM_JOB_NAME" => Some("train".to_string()),
        "SLURM_JOB_ID" => Some("77".to_string()),
        _ => None,
    });

    let logger = MemoryLogger::new();
    let stats = logger.stats();
    let mut state = trainer().with_logger(Box::new(logger));
    run_epoch(&mut state);
    for _ in 0..3 {
        toy::fit_batch(&mut state, 0.25).unwrap();
    }
    let weights_at_preemption = state.model.state_dict();
    let shared = Arc::new(Mutex::new(state));

    let handler = PreemptionHandler::new(
        &config,
        env,
        Arc::clone(&shared),
        Arc::new(SingleProcess::new()),
    );
    let outcome = handler.on_preempt().await.unwrap();
    let hpc_path = config.weights_save_path.join("hpc_ckpt_1.ckpt");
    assert_eq!(
        outcome,
        PreemptOutcome::Saved {
            path: hpc_path.clone(),
            requeued: true
        }
    );
    assert_eq!(stats.saves.load(std::sync::atomic::Ordering::SeqCst), 2);

    // The requeued job starts fresh and finds the preemption checkpoint, even
    // with an explicit resume path configured.
    let mut restart_config = config.clone();
    restart_config.resume_from_checkpoint = Some(dir.path().join("does-not-matter.ckpt"));
    let mut restarted = trainer();
    let report = RestoreOrchestrator::from_config(&restart_config, Arc::new(SingleProcess::new()))
        .restore(&mut restarted)
        .unwrap();

    assert_eq!(report.source, RestoreSource::Hpc(hpc_path));
    assert_eq!(restarted.global_step, BATCHES + 3 + 1);
    assert_eq!(restarted.current_epoch, 2);
    assert_eq!(restarted.model.state_dict(), weights_at_preemption);
    // 12 % 8 = 4: the notice arrived mid-epoch.
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn test_strict_policy_rejects_changed_optimizer_list() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.state_count_policy = StateCountPolicy::Strict;
    let codec = CheckpointCodec::new(config.state_count_policy);
    let store = CheckpointStore::new(&config.weights_save_path);

    let path = codec
        .save_next(&trainer(), &store, &CheckpointFamily::hpc())
        .unwrap();
    let mut extra = trainer().with_optimizer(Box::new(toy::MomentumSgd::new(0.1, 0.0, PARAMS)));
    let err = codec
        .hpc_load(&mut extra, &path, config.device)
        .unwrap_err();
    assert!(err.to_string().contains("optimizer"), "{err}");
}
