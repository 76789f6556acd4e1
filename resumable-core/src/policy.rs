//! Training policies whose state is carried across restarts: best-model
//! selection and early stopping.

use serde::{Deserialize, Serialize};

/// An optional policy slot.
///
/// A trainer may have no policy configured, have one configured but switched
/// off, or have an active one. Only active policies take part in checkpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Policy<T> {
    #[default]
    Absent,
    Disabled,
    Active(T),
}

impl<T> Policy<T> {
    pub fn active(&self) -> Option<&T> {
        match self {
            Policy::Active(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut T> {
        match self {
            Policy::Active(inner) => Some(inner),
            _ => None,
        }
    }
}

impl<T> From<Option<T>> for Policy<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Policy::Absent, Policy::Active)
    }
}

/// Whether a lower or higher monitored value is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    #[default]
    Min,
    Max,
}

impl MonitorMode {
    fn initial(self) -> f64 {
        match self {
            MonitorMode::Min => f64::INFINITY,
            MonitorMode::Max => f64::NEG_INFINITY,
        }
    }

    fn improves(self, candidate: f64, best: f64, min_delta: f64) -> bool {
        match self {
            MonitorMode::Min => candidate < best - min_delta,
            MonitorMode::Max => candidate > best + min_delta,
        }
    }
}

/// Tracks the best monitored score seen so far.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCheckpoint {
    pub monitor: String,
    pub mode: MonitorMode,
    pub best: f64,
}

impl ModelCheckpoint {
    pub fn new(monitor: impl Into<String>, mode: MonitorMode) -> Self {
        Self {
            monitor: monitor.into(),
            mode,
            best: mode.initial(),
        }
    }

    /// Record a score; returns true when it is a new best.
    pub fn observe(&mut self, score: f64) -> bool {
        if self.mode.improves(score, self.best, 0.0) {
            self.best = score;
            true
        } else {
            false
        }
    }
}

/// Stops training after `patience` evaluations without improvement.
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopping {
    pub monitor: String,
    pub mode: MonitorMode,
    pub patience: u32,
    pub min_delta: f64,
    /// Evaluations since the last improvement.
    pub wait: u32,
    best: f64,
}

impl EarlyStopping {
    pub fn new(monitor: impl Into<String>, patience: u32, min_delta: f64) -> Self {
        Self {
            monitor: monitor.into(),
            mode: MonitorMode::Min,
            patience,
            min_delta,
            wait: 0,
            best: MonitorMode::Min.initial(),
        }
    }

    pub fn with_mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode;
        self.best = mode.initial();
        self
    }

    /// Record a score; returns true when training should stop.
    pub fn observe(&mut self, score: f64) -> bool {
        if self.mode.improves(score, self.best, self.min_delta) {
            self.best = score;
            self.wait = 0;
            false
        } else {
            self.wait += 1;
            self.wait >= self.patience
        }
    }
}
