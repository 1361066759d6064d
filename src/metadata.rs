//! Run metadata for reproducible signal runs and sweeps.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

/// Size and checksum of an input table on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMetadata {
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the contents.
    pub checksum: String,
}

impl DataFileMetadata {
    pub fn capture(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let size = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.display().to_string(),
            size,
            checksum: compute_file_checksum(path)?,
        })
    }
}

/// Identity of one run: id, start time, configuration hash and input files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub config_hash: String,
    #[serde(default)]
    pub data_files: Vec<DataFileMetadata>,
}

impl RunMetadata {
    pub fn new<T: Serialize>(config: &T) -> Self {
        Self {
            run_id: generate_run_id(),
            started_at: Utc::now(),
            config_hash: compute_config_hash(config),
            data_files: Vec::new(),
        }
    }

    /// Record an input file's checksum.
    pub fn with_data_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.data_files.push(DataFileMetadata::capture(path)?);
        Ok(self)
    }
}

/// SHA-256 of a file's contents, hex encoded.
pub fn compute_file_checksum(path: impl AsRef<Path>) -> std::io::Result<String> {
    let data = std::fs::read(path.as_ref())?;
    Ok(compute_hash(&data))
}

/// SHA-256 of arbitrary bytes, hex encoded.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash of a value's JSON serialization.
///
/// Returns an empty string if the value cannot be serialized.
pub fn compute_config_hash<T: Serialize>(config: &T) -> String {
    match serde_json::to_vec(config) {
        Ok(bytes) => compute_hash(&bytes),
        Err(e) => {
            warn!("Failed to serialize config for hashing: {}", e);
            String::new()
        }
    }
}

pub fn generate_run_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash(b"prices");
        assert_eq!(hash, compute_hash(b"prices"));
        assert_ne!(hash, compute_hash(b"volume"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_config_hash_is_order_stable() {
        let mut a = BTreeMap::new();
        a.insert("threshold", 60.0);
        a.insert("fee_rate", 0.001);
        let mut b = BTreeMap::new();
        b.insert("fee_rate", 0.001);
        b.insert("threshold", 60.0);
        assert_eq!(compute_config_hash(&a), compute_config_hash(&b));

        b.insert("threshold", 65.0);
        assert_ne!(compute_config_hash(&a), compute_config_hash(&b));
    }

    #[test]
    fn test_run_metadata_with_data_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,AAA\n2024-01-01,100").unwrap();
        file.flush().unwrap();

        let metadata = RunMetadata::new(&"config")
            .with_data_file(file.path())
            .unwrap();
        assert_eq!(metadata.data_files.len(), 1);
        assert!(metadata.data_files[0].size > 0);
        assert_eq!(
            metadata.data_files[0].checksum,
            compute_file_checksum(file.path()).unwrap()
        );
        assert_ne!(metadata.run_id, RunMetadata::new(&"config").run_id);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(DataFileMetadata::capture("/nonexistent/prices.csv").is_err());
    }
}
