//! The checkpoint record: everything needed to resume a training run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::StateDict;

/// Current on-disk format version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// A complete, versioned snapshot of distributed training state.
///
/// `epoch` and `global_step` are the values to resume *at*, i.e. one past the
/// last completed epoch/step at the time of the dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub epoch: u64,
    pub global_step: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "score_repr"
    )]
    pub checkpoint_best_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stop_wait: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stop_patience: Option<u32>,
    /// One entry per optimizer, in optimizer order.
    #[serde(default)]
    pub optimizer_states: Vec<StateDict>,
    /// One entry per learning-rate scheduler, in scheduler order.
    #[serde(default)]
    pub scheduler_states: Vec<StateDict>,
    pub model_state: StateDict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparameters: Option<Value>,
    /// Free-form fields injected by model hooks.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extension: Map<String, Value>,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl CheckpointRecord {
    /// A record holding only counters and a model snapshot.
    pub fn new(epoch: u64, global_step: u64, model_state: StateDict) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            epoch,
            global_step,
            checkpoint_best_score: None,
            early_stop_wait: None,
            early_stop_patience: None,
            optimizer_states: Vec::new(),
            scheduler_states: Vec::new(),
            model_state,
            hyperparameters: None,
            extension: Map::new(),
        }
    }

    /// Remove and return the hyperparameters, if any.
    pub fn strip_hyperparameters(&mut self) -> Option<Value> {
        self.hyperparameters.take()
    }
}

/// Optional best score with non-finite values written as text: a
/// model-selection policy that has not seen a score yet holds `+inf`/`-inf`.
mod score_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(transparent)]
    struct Score(#[serde(with = "crate::state::float_repr")] f64);

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(Score).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<f64>, D::Error> {
        Ok(Option::<Score>::deserialize(deserializer)?.map(|score| score.0))
    }
}
