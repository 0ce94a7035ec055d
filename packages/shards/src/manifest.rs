//! The shard manifest (`ndarray-cache.json`).
//!
//! A manifest lists data blobs in order. Each blob holds the raw bytes of
//! one or more named records at fixed byte ranges.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sandlink_bridge::DataType;

use crate::error::{Result, ShardError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardManifest {
    /// Free-form model metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub records: Vec<BlobEntry>,
}

/// One data file and the records stored in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobEntry {
    /// Path of the blob relative to the manifest.
    pub data_path: String,
    pub nbytes: u64,
    pub records: Vec<ShardRecord>,
}

/// A named tensor stored at a byte range of its blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardRecord {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: String,
    /// Storage encoding, e.g. `raw` or `f32-to-bf16`.
    pub format: String,
    pub byte_offset: u64,
    pub nbytes: u64,
}

impl ShardRecord {
    /// The record's bytes within its blob.
    pub fn slice<'a>(&self, blob: &'a [u8]) -> Result<&'a [u8]> {
        let start = usize::try_from(self.byte_offset).ok();
        let len = usize::try_from(self.nbytes).ok();
        start
            .zip(len)
            .and_then(|(start, len)| blob.get(start..start.checked_add(len)?))
            .ok_or_else(|| {
                ShardError::InvalidManifest(format!(
                    "record {} [{}..+{}] lies outside its {}-byte blob",
                    self.name,
                    self.byte_offset,
                    self.nbytes,
                    blob.len()
                ))
            })
    }
}

impl ShardManifest {
    /// Parse and validate a manifest.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Sum of all blob sizes.
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|blob| blob.nbytes).sum()
    }

    pub fn record_count(&self) -> usize {
        self.records.iter().map(|blob| blob.records.len()).sum()
    }

    /// Check that every record fits inside its blob and has a known dtype.
    pub fn validate(&self) -> Result<()> {
        for blob in &self.records {
            for record in &blob.records {
                let end = record.byte_offset.checked_add(record.nbytes);
                if end.map_or(true, |end| end > blob.nbytes) {
                    return Err(ShardError::InvalidManifest(format!(
                        "record {} ends past the end of {} ({} bytes)",
                        record.name, blob.data_path, blob.nbytes
                    )));
                }
                record.dtype.parse::<DataType>().map_err(|_| {
                    ShardError::InvalidManifest(format!(
                        "record {} has unknown dtype {}",
                        record.name, record.dtype
                    ))
                })?;
            }
        }
        Ok(())
    }
}
