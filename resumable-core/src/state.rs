//! Opaque state snapshots exchanged with models, optimizers, and schedulers.
//!
//! A [`StateDict`] is an ordered map of named values. Tensor-valued entries
//! carry a [`Device`] tag that is never serialized, so anything decoded from a
//! checkpoint starts out CPU-resident and must be moved explicitly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Result;

/// A named snapshot of component state.
pub type StateDict = BTreeMap<String, StateValue>;

/// Where a tensor currently lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    /// An accelerator identified by its ordinal (the "root" device).
    Accelerator(u32),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(ordinal) => write!(f, "accelerator:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        let ordinal = s
            .strip_prefix("accelerator:")
            .or_else(|| s.strip_prefix("cuda:"))
            .or_else(|| s.strip_prefix("gpu:"))
            .ok_or_else(|| format!("unknown device '{s}'"))?;
        ordinal
            .parse()
            .map(Device::Accelerator)
            .map_err(|_| format!("invalid device ordinal in '{s}'"))
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// A dense tensor as seen by the checkpoint layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    #[serde(with = "f32_bytes")]
    pub data: Vec<f32>,
    #[serde(skip)]
    device: Device,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            shape,
            data,
            device: Device::Cpu,
        }
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(vec![len], vec![0.0; len])
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Move this tensor to `device`. Returns whether anything moved.
    pub fn move_to(&mut self, device: Device) -> bool {
        if self.device == device {
            return false;
        }
        self.device = device;
        true
    }
}

/// Tensor data as base64 of little-endian `f32`s, so non-finite values and
/// exact bit patterns survive the trip through JSON.
mod f32_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(D::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(D::Error::custom(format!(
                "tensor data length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// `f64` as a JSON number, or as `"inf"`, `"-inf"` or `"nan"` when it is
/// not finite. JSON has no literal for those and `serde_json` writes `null`.
pub(crate) mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid float '{other}'"))),
            },
        }
    }
}

/// One entry of a [`StateDict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    Tensor(Tensor),
    Float(#[serde(with = "float_repr")] f64),
    Int(i64),
    Bool(bool),
    Text(String),
    List(Vec<StateValue>),
    Map(StateDict),
}

impl StateValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            StateValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            StateValue::Float(v) => Some(*v),
            StateValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Move every top-level tensor of `entry` to `device`, one entry at a time.
///
/// Returns the number of tensors that changed device.
pub fn move_entry_tensors(entry: &mut StateDict, device: Device) -> usize {
    let mut moved = 0;
    for value in entry.values_mut() {
        if let StateValue::Tensor(tensor) = value {
            if tensor.move_to(device) {
                moved += 1;
            }
        }
    }
    moved
}

/// A component whose state can be snapshotted and restored.
pub trait Stateful {
    /// Capture the current state.
    fn state_dict(&self) -> StateDict;

    /// Replace the current state with `state`.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}
