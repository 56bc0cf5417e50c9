use std::fs;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::Utc;
use regex::Regex;
use reqwest::blocking::Client;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::credentials::CredentialStore;
use crate::domain::{FormPolicy, MediaFile, RemoteFormDescriptor};
use crate::error::SyncError;
use crate::fs_util;
use crate::http;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::repository::{FormsRepository, NewForm};
use crate::store::{Store, atomic_rename_dir};

pub trait FormDownloader: Send + Sync {
    /// Fetches one form's definition and media into local storage and records it.
    ///
    /// Fails with [`SyncError::FormDownload`], or [`SyncError::Interrupted`] when the token is
    /// cancelled between files.
    fn download_form(
        &self,
        descriptor: &RemoteFormDescriptor,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>;
}

impl<T: FormDownloader + ?Sized> FormDownloader for Arc<T> {
    fn download_form(
        &self,
        descriptor: &RemoteFormDescriptor,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        (**self).download_form(descriptor, progress, cancel)
    }
}

/// Submission settings a form definition declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionMetadata {
    pub submission_uri: Option<String>,
    pub auto_send: FormPolicy,
    pub auto_delete: FormPolicy,
}

impl SubmissionMetadata {
    pub fn from_definition(definition: &str) -> Self {
        static SUBMISSION: OnceLock<Regex> = OnceLock::new();
        let submission = SUBMISSION.get_or_init(|| {
            Regex::new(r"<submission\b[^>]*>").expect("submission element pattern is valid")
        });
        let Some(element) = submission.find(definition) else {
            return Self::default();
        };
        let element = element.as_str();
        Self {
            submission_uri: attribute(element, "action").filter(|uri| !uri.trim().is_empty()),
            auto_send: policy_attribute(element, "auto-send"),
            auto_delete: policy_attribute(element, "auto-delete"),
        }
    }
}

fn attribute(element: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"(?:^|[\s:]){}\s*=\s*"([^"]*)""#, regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(element)
        .and_then(|caps| caps.get(1))
        .map(|value| value.as_str().to_string())
}

fn policy_attribute(element: &str, name: &str) -> FormPolicy {
    match attribute(element, name).map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if value == "true" => FormPolicy::On,
        Some(value) if value == "false" => FormPolicy::Off,
        _ => FormPolicy::Inherit,
    }
}

#[derive(Clone)]
pub struct HttpFormDownloader {
    client: Client,
    credentials: CredentialStore,
    store: Store,
    forms: Arc<dyn FormsRepository>,
}

impl HttpFormDownloader {
    pub fn new(
        store: Store,
        forms: Arc<dyn FormsRepository>,
        credentials: CredentialStore,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(60))?,
            credentials,
            store,
            forms,
        })
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SyncError> {
        let response = http::send_with_retries(|| {
            http::with_credentials(self.client.get(url), &self.credentials, url)
        })?;
        let response = http::handle_status(response)?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| SyncError::Http(err.to_string()))
    }

    fn fetch_manifest(&self, url: &str) -> Result<Vec<MediaFile>, SyncError> {
        let bytes = self.get_bytes(url)?;
        serde_json::from_slice(&bytes)
            .map_err(|err| SyncError::Http(format!("invalid media manifest: {err}")))
    }

    fn download(
        &self,
        descriptor: &RemoteFormDescriptor,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        cancel.check()?;
        let form_id = descriptor.form_id.as_str();
        let version = descriptor.version.as_deref();
        let start = Instant::now();

        let forms_dir = self.store.forms_dir();
        fs::create_dir_all(forms_dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let temp_dir = tempfile::Builder::new()
            .prefix(".fieldsync-download")
            .tempdir_in(forms_dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let staging = Utf8PathBuf::from_path_buf(temp_dir.path().join("form"))
            .map_err(|_| SyncError::Filesystem("non-utf8 temp path".to_string()))?;

        progress.event(ProgressEvent::new(format!("phase=Download; form {form_id}")));
        let definition = self.get_bytes(&descriptor.download.download_url)?;
        let final_definition = self.store.form_definition_path(form_id, version);
        let definition_name = final_definition
            .file_name()
            .ok_or_else(|| SyncError::Filesystem("invalid form path".to_string()))?;
        Store::write_bytes_atomic(&staging.join(definition_name), &definition)?;

        let media = match descriptor.download.manifest_url.as_deref() {
            Some(url) => self.fetch_manifest(url)?,
            None => Vec::new(),
        };
        let media_dir = staging.join("media");
        fs::create_dir_all(media_dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for (index, file) in media.iter().enumerate() {
            cancel.check()?;
            let name = media_file_name(&file.filename)?;
            progress.event(ProgressEvent::new(format!(
                "phase=Download; media {}/{} {name}",
                index + 1,
                media.len()
            )));
            let bytes = self.get_bytes(&file.download_url)?;
            Store::write_bytes_atomic(&media_dir.join(name), &bytes)?;
        }

        cancel.check()?;
        let target = self.store.form_dir(form_id, version);
        atomic_rename_dir(staging.as_std_path(), target.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;

        let metadata = SubmissionMetadata::from_definition(&String::from_utf8_lossy(&definition));
        let hash = descriptor
            .hash
            .clone()
            .unwrap_or_else(|| fs_util::bytes_hash(&definition));
        match self.forms.get_latest_by_form_id_and_version(form_id, version)? {
            Some(mut existing) => {
                existing.display_name = descriptor.name.clone();
                existing.definition_path = final_definition;
                existing.media_dir = self.store.form_media_dir(form_id, version);
                existing.hash = hash;
                existing.submission_uri = metadata.submission_uri;
                existing.auto_send = metadata.auto_send;
                existing.auto_delete = metadata.auto_delete;
                existing.downloaded_at = Utc::now();
                self.forms.update(&existing)?;
            }
            None => {
                self.forms.insert(NewForm {
                    form_id: form_id.to_string(),
                    version: descriptor.version.clone(),
                    display_name: descriptor.name.clone(),
                    definition_path: final_definition,
                    media_dir: self.store.form_media_dir(form_id, version),
                    hash,
                    submission_uri: metadata.submission_uri,
                    auto_send: metadata.auto_send,
                    auto_delete: metadata.auto_delete,
                })?;
            }
        }

        let elapsed = start.elapsed();
        progress.event(ProgressEvent {
            message: format!("phase=Store; form {form_id} stored"),
            elapsed: Some(elapsed),
        });
        info!(
            form_id,
            media = media.len(),
            latency_ms = elapsed.as_millis() as u64,
            "downloaded form"
        );
        Ok(())
    }
}

impl FormDownloader for HttpFormDownloader {
    fn download_form(
        &self,
        descriptor: &RemoteFormDescriptor,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.download(descriptor, progress, cancel)
            .map_err(|err| match err {
                SyncError::Interrupted => SyncError::Interrupted,
                SyncError::FormDownload { .. } => err,
                other => {
                    debug!(form_id = %descriptor.form_id, error = %other, "form download failed");
                    SyncError::FormDownload {
                        form_id: descriptor.form_id.clone(),
                        message: other.to_string(),
                    }
                }
            })
    }
}

fn media_file_name(name: &str) -> Result<&str, SyncError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\');
    if invalid {
        return Err(SyncError::Filesystem(format!(
            "media file name rejected: {name}"
        )));
    }
    Ok(trimmed)
}
