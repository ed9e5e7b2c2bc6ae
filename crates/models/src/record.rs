use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Id;

/// The lifecycle state of a record. See the status engine for the allowed
/// transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "record_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
    Invalid,
    Deleted,
}

impl RecordStatus {
    /// States in which a leaf record owns a task row (and a service record
    /// owns a live service row).
    pub fn has_compute_row(&self) -> bool {
        matches!(
            self,
            RecordStatus::Waiting | RecordStatus::Running | RecordStatus::Error
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordStatus::Waiting => "waiting",
            RecordStatus::Running => "running",
            RecordStatus::Complete => "complete",
            RecordStatus::Error => "error",
            RecordStatus::Cancelled => "cancelled",
            RecordStatus::Invalid => "invalid",
            RecordStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Discriminator for the polymorphic record row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "record_type", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Singlepoint,
    Optimization,
    Torsiondrive,
    Gridoptimization,
    Manybody,
    Reaction,
    Neb,
}

impl RecordType {
    pub fn is_service(&self) -> bool {
        !matches!(self, RecordType::Singlepoint | RecordType::Optimization)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Singlepoint => "singlepoint",
            RecordType::Optimization => "optimization",
            RecordType::Torsiondrive => "torsiondrive",
            RecordType::Gridoptimization => "gridoptimization",
            RecordType::Manybody => "manybody",
            RecordType::Reaction => "reaction",
            RecordType::Neb => "neb",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Ordering is meaningful: higher priorities claim first.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "compute_priority", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum ComputePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// What a leaf calculation computes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "qc_driver", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Energy,
    Gradient,
    Hessian,
    Properties,
    Deferred,
}

/// Output channels attached to a compute-history entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "output_type", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Stdout,
    Stderr,
    Error,
}

/// Compression applied to a stored blob.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "compression_kind", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    #[default]
    None,
    Gzip,
}

/// A blob with its compression metadata, as carried on the wire and stored
/// in output/native-file rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedBlob {
    pub compression: CompressionKind,
    #[serde(with = "blob_bytes")]
    pub data: Vec<u8>,
}

impl CompressedBlob {
    pub fn plain(text: &str) -> Self {
        Self {
            compression: CompressionKind::None,
            data: text.as_bytes().to_vec(),
        }
    }

    pub fn gzip(text: &str) -> std::io::Result<Self> {
        use flate2::{write::GzEncoder, Compression};
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text.as_bytes())?;
        Ok(Self {
            compression: CompressionKind::Gzip,
            data: enc.finish()?,
        })
    }

    /// Decompress into a UTF-8 string.
    pub fn decompress(&self) -> std::io::Result<String> {
        use std::io::Read;

        match self.compression {
            CompressionKind::None => String::from_utf8(self.data.clone())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            CompressionKind::Gzip => {
                let mut dec = flate2::read::GzDecoder::new(self.data.as_slice());
                let mut out = String::new();
                dec.read_to_string(&mut out)?;
                Ok(out)
            }
        }
    }
}

mod blob_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One entry of a record's append-only compute history: a single manager
/// (or service-engine) attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeHistoryEntry {
    pub id: Id,
    pub record_id: Id,
    pub status: RecordStatus,
    pub manager_name: Option<String>,
    pub modified_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<OutputType, CompressedBlob>,
}

/// An append-only comment on a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordComment {
    pub id: Id,
    pub record_id: Id,
    pub username: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_compute_row_states() {
        assert!(RecordStatus::Waiting.has_compute_row());
        assert!(RecordStatus::Running.has_compute_row());
        assert!(RecordStatus::Error.has_compute_row());
        assert!(!RecordStatus::Complete.has_compute_row());
        assert!(!RecordStatus::Cancelled.has_compute_row());
        assert!(!RecordStatus::Deleted.has_compute_row());
    }

    #[test]
    fn priority_orders_low_to_high() {
        assert!(ComputePriority::High > ComputePriority::Normal);
        assert!(ComputePriority::Normal > ComputePriority::Low);
    }

    #[test]
    fn blob_round_trips_gzip() {
        let blob = CompressedBlob::gzip("hello output").unwrap();
        assert_eq!(blob.compression, CompressionKind::Gzip);
        assert_eq!(blob.decompress().unwrap(), "hello output");

        let plain = CompressedBlob::plain("raw");
        assert_eq!(plain.decompress().unwrap(), "raw");
    }
}
