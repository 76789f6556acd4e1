//! Small working implementations of the collaborator traits.
//!
//! A quadratic-loss model, a momentum optimizer, a step learning-rate schedule
//! and an in-memory metric logger. They are enough to drive a real
//! checkpoint/restore cycle in tests and in the CLI demo.

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::codec::TrainerState;
use crate::components::{CheckpointHooks, LrScheduler, MetricLogger, Optimizer, TrainableModel};
use crate::error::{CheckpointError, Result};
use crate::record::CheckpointRecord;
use crate::state::{Device, StateDict, StateValue, Stateful, Tensor};

const EXTENSION_KEY: &str = "toy_model";

/// A single weight vector fitted towards a constant target.
#[derive(Debug, Clone)]
pub struct ToyModel {
    weight: Tensor,
    hyperparameters: Option<Value>,
    /// Extension payload seen by the last `on_load_checkpoint`.
    pub loaded_extension: Option<Value>,
    /// Number of preemption checkpoints restored into this model.
    pub hpc_loads: u32,
}

impl ToyModel {
    pub fn new(len: usize) -> Self {
        let data = (0..len).map(|i| 1.0 + i as f32 * 0.5).collect();
        Self {
            weight: Tensor::new(vec![len], data),
            hyperparameters: None,
            loaded_extension: None,
            hpc_loads: 0,
        }
    }

    pub fn with_hyperparameters(mut self, hparams: Value) -> Self {
        self.hyperparameters = Some(hparams);
        self
    }
}

impl Stateful for ToyModel {
    fn state_dict(&self) -> StateDict {
        StateDict::from([("weight".to_string(), StateValue::Tensor(self.weight.clone()))])
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let weight = state
            .get("weight")
            .and_then(StateValue::as_tensor)
            .ok_or_else(|| CheckpointError::collaborator("model", "missing 'weight' tensor"))?;
        if weight.shape != self.weight.shape {
            return Err(CheckpointError::collaborator(
                "model",
                format!(
                    "weight shape {:?} does not match {:?}",
                    weight.shape, self.weight.shape
                ),
            ));
        }
        self.weight = weight.clone();
        Ok(())
    }
}

impl CheckpointHooks for ToyModel {
    fn on_save_checkpoint(&self, record: &mut CheckpointRecord) {
        record.extension.insert(
            EXTENSION_KEY.to_string(),
            json!({ "parameters": self.weight.data.len() }),
        );
    }

    fn on_load_checkpoint(&mut self, record: &CheckpointRecord) {
        self.loaded_extension = record.extension.get(EXTENSION_KEY).cloned();
    }

    fn on_hpc_load(&mut self, _record: &CheckpointRecord) {
        self.hpc_loads += 1;
    }
}

impl TrainableModel for ToyModel {
    fn to_device(&mut self, device: Device) {
        self.weight.move_to(device);
    }

    fn hyperparameters(&self) -> Option<Value> {
        self.hyperparameters.clone()
    }
}

/// SGD with momentum. Holds one state entry per parameter tensor.
#[derive(Debug, Clone)]
pub struct MomentumSgd {
    lr: f64,
    momentum: f64,
    entries: Vec<StateDict>,
}

impl MomentumSgd {
    pub fn new(lr: f64, momentum: f64, param_len: usize) -> Self {
        let entry = StateDict::from([
            (
                "momentum_buffer".to_string(),
                StateValue::Tensor(Tensor::zeros(param_len)),
            ),
            ("step".to_string(), StateValue::Int(0)),
        ]);
        Self {
            lr,
            momentum,
            entries: vec![entry],
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn entries(&self) -> &[StateDict] {
        &self.entries
    }
}

impl Stateful for MomentumSgd {
    fn state_dict(&self) -> StateDict {
        StateDict::from([
            ("lr".to_string(), StateValue::Float(self.lr)),
            ("momentum".to_string(), StateValue::Float(self.momentum)),
            (
                "state".to_string(),
                StateValue::List(self.entries.iter().cloned().map(StateValue::Map).collect()),
            ),
        ])
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let float = |key: &str| {
            state
                .get(key)
                .and_then(StateValue::as_float)
                .ok_or_else(|| {
                    CheckpointError::collaborator("optimizer", format!("missing '{key}'"))
                })
        };
        let Some(StateValue::List(entries)) = state.get("state") else {
            return Err(CheckpointError::collaborator("optimizer", "missing 'state' list"));
        };
        let entries = entries
            .iter()
            .map(|entry| match entry {
                StateValue::Map(map) => Ok(map.clone()),
                _ => Err(CheckpointError::collaborator(
                    "optimizer",
                    "state entries must be maps",
                )),
            })
            .collect::<Result<Vec<_>>>()?;

        self.lr = float("lr")?;
        self.momentum = float("momentum")?;
        self.entries = entries;
        Ok(())
    }
}

impl Optimizer for MomentumSgd {
    fn state_entries_mut(&mut self) -> Vec<&mut StateDict> {
        self.entries.iter_mut().collect()
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    step_size: u64,
    gamma: f64,
    last_epoch: u64,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: u64, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
        }
    }

    pub fn step(&mut self) {
        self.last_epoch += 1;
    }

    pub fn lr(&self) -> f64 {
        let decays = (self.last_epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }
}

impl Stateful for StepLr {
    fn state_dict(&self) -> StateDict {
        StateDict::from([
            ("base_lr".to_string(), StateValue::Float(self.base_lr)),
            ("step_size".to_string(), StateValue::Int(self.step_size as i64)),
            ("gamma".to_string(), StateValue::Float(self.gamma)),
            ("last_epoch".to_string(), StateValue::Int(self.last_epoch as i64)),
            ("lr".to_string(), StateValue::Float(self.lr())),
        ])
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let int = |key: &str| {
            state
                .get(key)
                .and_then(StateValue::as_int)
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| {
                    CheckpointError::collaborator("scheduler", format!("missing '{key}'"))
                })
        };
        let float = |key: &str| {
            state
                .get(key)
                .and_then(StateValue::as_float)
                .ok_or_else(|| {
                    CheckpointError::collaborator("scheduler", format!("missing '{key}'"))
                })
        };
        self.base_lr = float("base_lr")?;
        self.gamma = float("gamma")?;
        self.step_size = int("step_size")?.max(1);
        self.last_epoch = int("last_epoch")?;
        Ok(())
    }
}

impl LrScheduler for StepLr {}

/// Counters shared between a [`MemoryLogger`] and whoever inspects it.
#[derive(Debug, Default)]
pub struct LoggerStats {
    pub saves: AtomicUsize,
    pub closes: AtomicUsize,
}

/// Keeps metrics in memory and counts flushes.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    metrics: Vec<(String, f64)>,
    stats: Arc<LoggerStats>,
    fail_saves: bool,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A logger whose `save` always fails.
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> Arc<LoggerStats> {
        Arc::clone(&self.stats)
    }

    pub fn log(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.push((name.into(), value));
    }

    pub fn metrics(&self) -> &[(String, f64)] {
        &self.metrics
    }
}

impl MetricLogger for MemoryLogger {
    fn save(&mut self) -> Result<()> {
        if self.fail_saves {
            return Err(CheckpointError::collaborator("logger", "metric store unavailable"));
        }
        self.stats.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.save()?;
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A trainer over a `len`-parameter [`ToyModel`] with one [`MomentumSgd`] and
/// one [`StepLr`].
pub fn toy_trainer(len: usize, num_training_batches: u64) -> TrainerState {
    TrainerState::new(Box::new(ToyModel::new(len)))
        .with_optimizer(Box::new(MomentumSgd::new(0.1, 0.9, len)))
        .with_scheduler(Box::new(StepLr::new(0.1, 2, 0.5)))
        .with_batches(num_training_batches, None)
}

/// One momentum step on the loss `0.5 * |w - target|^2`, applied through the
/// state interfaces of the first optimizer. Advances `global_step` and
/// returns the loss before the step.
pub fn fit_batch(state: &mut TrainerState, target: f32) -> Result<f64> {
    let mut params = state.model.state_dict();
    let Some(StateValue::Tensor(weight)) = params.get_mut("weight") else {
        return Err(CheckpointError::collaborator("model", "missing 'weight' tensor"));
    };
    let grad: Vec<f32> = weight.data.iter().map(|w| w - target).collect();
    let loss = grad.iter().map(|g| 0.5 * f64::from(*g).powi(2)).sum::<f64>();

    let optimizer = state
        .optimizers
        .first_mut()
        .ok_or_else(|| CheckpointError::collaborator("optimizer", "no optimizer configured"))?;
    let hyper = optimizer.state_dict();
    let lr = hyper.get("lr").and_then(StateValue::as_float).unwrap_or(0.1) as f32;
    let momentum = hyper
        .get("momentum")
        .and_then(StateValue::as_float)
        .unwrap_or(0.0) as f32;

    if let Some(entry) = optimizer.state_entries_mut().into_iter().next() {
        if let Some(StateValue::Tensor(buffer)) = entry.get_mut("momentum_buffer") {
            for ((b, g), w) in buffer.data.iter_mut().zip(&grad).zip(weight.data.iter_mut()) {
                *b = momentum * *b + g;
                *w -= lr * *b;
            }
        }
        if let Some(StateValue::Int(step)) = entry.get_mut("step") {
            *step += 1;
        }
    }

    state.model.load_state_dict(&params)?;
    state.global_step += 1;
    Ok(loss)
}

/// Steps every scheduler and pushes the first scheduler's rate into the first
/// optimizer.
pub fn step_schedulers(state: &mut TrainerState) -> Result<()> {
    let mut lr = None;
    for scheduler in &mut state.schedulers {
        let mut sched_state = scheduler.state_dict();
        if let Some(StateValue::Int(last)) = sched_state.get_mut("last_epoch") {
            *last += 1;
        }
        scheduler.load_state_dict(&sched_state)?;
        if lr.is_none() {
            lr = scheduler.state_dict().get("lr").and_then(StateValue::as_float);
        }
    }
    if let (Some(lr), Some(optimizer)) = (lr, state.optimizers.first_mut()) {
        let mut opt_state = optimizer.state_dict();
        opt_state.insert("lr".to_string(), StateValue::Float(lr));
        optimizer.load_state_dict(&opt_state)?;
    }
    Ok(())
}
