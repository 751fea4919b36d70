use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// bincode-encodes `x` into `path`, creating parent directories as needed
pub fn serialize<T: Serialize>(x: &T, path: &Path) -> Result<()> {
    debug!("serializing {}", path.display());
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, x).map_err(|e| Error::checkpoint(path, e.to_string()))
}

pub fn deserialize<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("deserializing {}", path.display());
    let reader = File::open(path).map_err(|e| Error::checkpoint(path, e.to_string()))?;
    bincode::deserialize_from(BufReader::new(reader))
        .map_err(|e| Error::checkpoint(path, e.to_string()))
}

#[test]
fn bincode_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/value.bin");
    serialize(&(3usize, vec![1.5f32, -2.0]), &path).unwrap();
    let back: (usize, Vec<f32>) = deserialize(&path).unwrap();
    assert_eq!(back, (3, vec![1.5, -2.0]));
    let missing = deserialize::<u8>(&dir.path().join("missing"));
    assert!(matches!(missing, Err(Error::Checkpoint { .. })));
}
