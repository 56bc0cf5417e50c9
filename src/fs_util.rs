use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

pub const HASH_PREFIX: &str = "sha256:";

pub fn file_hash(path: &Utf8Path) -> Result<String, SyncError> {
    let mut file = fs::File::open(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("open {path}: {err}")))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(format!("{HASH_PREFIX}{:x}", hasher.finalize()))
}

pub fn bytes_hash(content: &[u8]) -> String {
    format!("{HASH_PREFIX}{:x}", Sha256::digest(content))
}

/// Regular files directly inside `dir`, sorted by name, excluding `skip`.
pub fn list_files(dir: &Utf8Path, skip: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SyncError> {
    if !dir.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|_| SyncError::Filesystem("non-utf8 file path in instance".to_string()))?;
        if path.as_std_path().is_file() && path != skip {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
