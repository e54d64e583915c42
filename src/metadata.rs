//! Input fingerprints for reproducible runs.
//!
//! Every identifier here is derived from content, so two runs over the same
//! inputs and configuration carry identical metadata.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, warn};

/// One input file a run was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMetadata {
    /// Role of the file in the run ("weights", "prices", ...).
    pub name: String,
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA256 of the file contents.
    pub checksum: String,
}

/// Compute SHA256 checksum of a file.
pub fn compute_file_checksum(path: impl AsRef<Path>) -> std::io::Result<String> {
    let data = std::fs::read(path.as_ref())?;
    Ok(compute_hash(&data))
}

/// Compute SHA256 hash of arbitrary bytes.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute configuration hash from JSON serialization.
pub fn compute_config_hash<T: Serialize>(config: &T) -> String {
    match serde_json::to_vec(config) {
        Ok(bytes) => compute_hash(&bytes),
        Err(e) => {
            warn!("Failed to serialize config for hashing: {}", e);
            String::new()
        }
    }
}

/// Size and checksum of one named input.
pub fn track_data_file(name: &str, path: impl AsRef<Path>) -> std::io::Result<DataFileMetadata> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    let checksum = compute_file_checksum(path)?;
    debug!("{} ({} bytes) checksum {}", name, size, checksum);

    Ok(DataFileMetadata {
        name: name.to_string(),
        path: path.display().to_string(),
        size,
        checksum,
    })
}

/// Metadata for every named input, in the order given. Files that cannot be
/// read are skipped with a warning.
pub fn track_inputs<'a>(
    inputs: impl IntoIterator<Item = (&'a str, &'a Path)>,
) -> Vec<DataFileMetadata> {
    inputs
        .into_iter()
        .filter_map(|(name, path)| match track_data_file(name, path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("Could not checksum {} ({}): {}", name, path.display(), e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_compute_file_checksum() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "datetime,000001.XSHE").unwrap();
        temp_file.flush().unwrap();

        let checksum = compute_file_checksum(temp_file.path()).unwrap();
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"weights");
        let hash2 = compute_hash(b"weights");
        let hash3 = compute_hash(b"prices");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_track_data_file_records_size() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "order_book_id,datetime").unwrap();
        temp_file.flush().unwrap();

        let meta = track_data_file("prices", temp_file.path()).unwrap();
        assert_eq!(meta.name, "prices");
        assert_eq!(meta.size, 22);
        assert_eq!(meta.checksum, compute_hash(b"order_book_id,datetime"));
    }

    #[test]
    fn test_track_inputs_skips_missing() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "x").unwrap();
        temp_file.flush().unwrap();

        let missing = Path::new("/definitely/not/here.csv");
        let inputs = track_inputs([("weights", temp_file.path()), ("prices", missing)]);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].name, "weights");
        assert_eq!(inputs[0].size, 2);
    }

    #[test]
    fn test_compute_config_hash() {
        #[derive(Serialize)]
        struct TestConfig {
            portfolio_count: usize,
            rebalance_frequency: usize,
        }

        let hash1 = compute_config_hash(&TestConfig { portfolio_count: 5, rebalance_frequency: 5 });
        let hash2 = compute_config_hash(&TestConfig { portfolio_count: 5, rebalance_frequency: 5 });
        let hash3 = compute_config_hash(&TestConfig { portfolio_count: 4, rebalance_frequency: 8 });

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }
}
