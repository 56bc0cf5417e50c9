use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{FormRecordId, InstanceId};
use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, SyncError> {
        let root = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("fieldsync")).ok())
            .ok_or_else(|| SyncError::Filesystem("unable to resolve data directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn forms_dir(&self) -> Utf8PathBuf {
        self.root.join("forms")
    }

    pub fn form_dir(&self, form_id: &str, version: Option<&str>) -> Utf8PathBuf {
        let version = version.map_or_else(|| "@none".to_string(), path_component);
        self.forms_dir().join(path_component(form_id)).join(version)
    }

    pub fn form_definition_path(&self, form_id: &str, version: Option<&str>) -> Utf8PathBuf {
        self.form_dir(form_id, version)
            .join(format!("{}.xml", path_component(form_id)))
    }

    pub fn form_media_dir(&self, form_id: &str, version: Option<&str>) -> Utf8PathBuf {
        self.form_dir(form_id, version).join("media")
    }

    pub fn instances_dir(&self) -> Utf8PathBuf {
        self.root.join("instances")
    }

    pub fn instance_dir(&self, id: InstanceId) -> Utf8PathBuf {
        self.instances_dir().join(id.to_string())
    }

    pub fn form_records_dir(&self) -> Utf8PathBuf {
        self.root.join("metadata").join("forms")
    }

    pub fn instance_records_dir(&self) -> Utf8PathBuf {
        self.root.join("metadata").join("instances")
    }

    pub fn form_record_path(&self, id: FormRecordId) -> Utf8PathBuf {
        self.form_records_dir().join(format!("{id}.json"))
    }

    pub fn instance_record_path(&self, id: InstanceId) -> Utf8PathBuf {
        self.instance_records_dir().join(format!("{id}.json"))
    }

    pub fn ensure_root(&self) -> Result<(), SyncError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    /// Hands out the next record id for `kind`. Ids are never reused.
    pub fn next_id(&self, kind: &str) -> Result<u64, SyncError> {
        let path = self.root.join("metadata").join(format!("next-{kind}"));
        let current = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content
                .trim()
                .parse::<u64>()
                .map_err(|err| SyncError::Repository(format!("corrupt id counter {path}: {err}")))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 1,
            Err(err) => return Err(SyncError::Filesystem(err.to_string())),
        };
        Self::write_bytes_atomic(&path, (current + 1).to_string().as_bytes())?;
        Ok(current)
    }

    pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), SyncError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| SyncError::Repository(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, SyncError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SyncError::Filesystem(err.to_string())),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| SyncError::Repository(format!("{path}: {err}")))
    }

    pub fn list_json<T: DeserializeOwned>(dir: &Utf8Path) -> Result<Vec<T>, SyncError> {
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for path in walk_dir(dir.as_std_path())? {
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let content = fs::read_to_string(&path)
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                let value: T = serde_json::from_str(&content).map_err(|err| {
                    SyncError::Repository(format!("{}: {err}", path.display()))
                })?;
                entries.push(value);
            }
        }
        Ok(entries)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("fieldsync-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn remove_file_if_exists(path: &Utf8Path) -> Result<(), SyncError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::Filesystem(err.to_string())),
        }
    }

    pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<(), SyncError> {
        match fs::remove_dir_all(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::Filesystem(err.to_string())),
        }
    }
}

pub(crate) fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}

// Percent-encodes everything outside [A-Za-z0-9._-], so distinct values never share a
// component. All-dot values are encoded too.
fn path_component(value: &str) -> String {
    let only_dots = value.bytes().all(|byte| byte == b'.');
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'_' | b'-')
            || (byte == b'.' && !only_dots);
        if keep {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
