//! Atomic checkpoint persistence.
//!
//! Every write goes to a `<path>.part` sibling which is fsynced and then
//! renamed over the destination, so readers see either the previous complete
//! file or the new complete file. A process killed mid-write leaves only the
//! orphaned `.part` file behind.
//!
//! On-disk layout: one JSON header line followed by the JSON payload.
//!
//! ```text
//! {"magic":"resumable-ckpt","format_version":1,"sha256":"…","payload_bytes":…,"created_at":"…"}
//! {"epoch":3,"global_step":121,…}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{CheckpointError, Result};
use crate::record::{CheckpointRecord, FORMAT_VERSION};

const MAGIC: &str = "resumable-ckpt";

/// Metadata line written ahead of every checkpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub magic: String,
    pub format_version: u32,
    pub sha256: String,
    pub payload_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// The temporary path a write to `path` goes through.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Atomically write raw bytes to a file.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = part_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Encode a record into the on-disk representation.
pub fn encode_record(record: &CheckpointRecord) -> Result<Vec<u8>> {
    if let Some(hparams) = &record.hyperparameters {
        if !hparams.is_object() {
            return Err(CheckpointError::Serialization {
                field: "hyperparameters".into(),
                message: format!("expected a mapping, found {}", json_kind(hparams)),
            });
        }
    }

    let payload = serde_json::to_vec(record).map_err(|e| CheckpointError::Serialization {
        field: "record".into(),
        message: e.to_string(),
    })?;

    let header = CheckpointHeader {
        magic: MAGIC.to_string(),
        format_version: record.format_version,
        sha256: sha256_hex(&payload),
        payload_bytes: payload.len() as u64,
        created_at: Utc::now(),
    };
    let mut out = serde_json::to_vec(&header)?;
    out.push(b'\n');
    out.extend_from_slice(&payload);
    Ok(out)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn split_header<'a>(path: &Path, bytes: &'a [u8]) -> Result<(CheckpointHeader, &'a [u8])> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| CheckpointError::corrupt(path, "missing header line"))?;
    let header: CheckpointHeader = serde_json::from_slice(&bytes[..newline])
        .map_err(|e| CheckpointError::corrupt(path, format!("unreadable header: {e}")))?;
    if header.magic != MAGIC {
        return Err(CheckpointError::corrupt(
            path,
            format!("unexpected magic '{}'", header.magic),
        ));
    }
    if header.format_version > FORMAT_VERSION {
        return Err(CheckpointError::corrupt(
            path,
            format!(
                "format version {} is newer than supported version {FORMAT_VERSION}",
                header.format_version
            ),
        ));
    }
    Ok((header, &bytes[newline + 1..]))
}

/// Decode and verify the on-disk representation read from `path`.
pub fn decode_record(path: &Path, bytes: &[u8]) -> Result<CheckpointRecord> {
    let (header, payload) = split_header(path, bytes)?;
    if payload.len() as u64 != header.payload_bytes {
        return Err(CheckpointError::corrupt(
            path,
            format!(
                "payload is {} bytes, header declares {}",
                payload.len(),
                header.payload_bytes
            ),
        ));
    }
    if sha256_hex(payload) != header.sha256 {
        return Err(CheckpointError::corrupt(path, "checksum mismatch"));
    }
    serde_json::from_slice(payload)
        .map_err(|e| CheckpointError::corrupt(path, format!("undecodable payload: {e}")))
}

/// Read only the header of the checkpoint at `path`.
pub fn read_header(path: &Path) -> Result<CheckpointHeader> {
    let bytes = fs::read(path)?;
    split_header(path, &bytes).map(|(header, _)| header)
}

/// Encode `record` and write it atomically to `path`.
pub fn atomic_save(record: &CheckpointRecord, path: &Path) -> Result<()> {
    let bytes = encode_record(record)?;
    atomic_write(path, &bytes)?;
    Ok(())
}

/// Write `record` to `path`, retrying once without hyperparameters if the
/// first attempt fails to serialize.
pub fn save_record(record: &mut CheckpointRecord, path: &Path) -> Result<()> {
    match atomic_save(record, path) {
        Err(err) if err.is_transient_serialization() && record.hyperparameters.is_some() => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "Checkpoint serialization failed; retrying without hyperparameters"
            );
            record.strip_hyperparameters();
            atomic_save(record, path)
        }
        other => other,
    }
}

/// Load and verify the checkpoint at `path`.
pub fn load_record(path: &Path) -> Result<CheckpointRecord> {
    let bytes = fs::read(path)?;
    decode_record(path, &bytes)
}
