use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormRecordId(u64);

impl FormRecordId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FormRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| SyncError::Repository(format!("invalid instance id: {value}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Incomplete,
    Complete,
    Submitted,
    SubmissionFailed,
}

impl InstanceStatus {
    /// Statuses a submission batch will pick up.
    pub const SENDABLE: [InstanceStatus; 2] =
        [InstanceStatus::Complete, InstanceStatus::SubmissionFailed];

    pub fn is_sendable(self) -> bool {
        Self::SENDABLE.contains(&self)
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Incomplete, Complete)
                | (Complete, Incomplete)
                | (Complete, Submitted)
                | (Complete, SubmissionFailed)
                | (SubmissionFailed, Submitted)
                | (SubmissionFailed, SubmissionFailed)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Incomplete => write!(f, "incomplete"),
            InstanceStatus::Complete => write!(f, "complete"),
            InstanceStatus::Submitted => write!(f, "submitted"),
            InstanceStatus::SubmissionFailed => write!(f, "submission_failed"),
        }
    }
}

/// Per-form override of an app-level setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormPolicy {
    #[default]
    Inherit,
    On,
    Off,
}

impl FormPolicy {
    pub fn resolve(self, app_setting: bool) -> bool {
        match self {
            FormPolicy::Inherit => app_setting,
            FormPolicy::On => true,
            FormPolicy::Off => false,
        }
    }
}

impl From<Option<bool>> for FormPolicy {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => FormPolicy::Inherit,
            Some(true) => FormPolicy::On,
            Some(false) => FormPolicy::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Server,
    Spreadsheet,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Server => write!(f, "server"),
            Protocol::Spreadsheet => write!(f, "spreadsheet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub id: FormRecordId,
    pub form_id: String,
    pub version: Option<String>,
    pub display_name: String,
    pub definition_path: Utf8PathBuf,
    pub media_dir: Utf8PathBuf,
    pub hash: String,
    #[serde(default)]
    pub submission_uri: Option<String>,
    #[serde(default)]
    pub auto_send: FormPolicy,
    #[serde(default)]
    pub auto_delete: FormPolicy,
    pub downloaded_at: DateTime<Utc>,
}

impl Form {
    pub fn matches(&self, form_id: &str, version: Option<&str>) -> bool {
        self.form_id == form_id && self.version.as_deref() == version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub form_id: String,
    pub form_version: Option<String>,
    pub display_name: String,
    pub status: InstanceStatus,
    pub instance_dir: Utf8PathBuf,
    pub submission_file: Utf8PathBuf,
    #[serde(default)]
    pub submission_uri: Option<String>,
    pub last_status_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Where to fetch a remote form from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub download_url: String,
    #[serde(default)]
    pub manifest_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFormDescriptor {
    pub form_id: String,
    pub name: String,
    pub version: Option<String>,
    pub hash: Option<String>,
    pub download: DownloadDescriptor,
    pub is_not_on_device: bool,
    pub is_updated: bool,
}

impl RemoteFormDescriptor {
    pub fn needs_download(&self) -> bool {
        self.is_not_on_device || self.is_updated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub filename: String,
    #[serde(default)]
    pub hash: Option<String>,
    pub download_url: String,
}
