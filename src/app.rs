use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use camino::Utf8Path;
use serde::Serialize;
use tracing::info;

use crate::cancel::CancellationToken;
use crate::config::{GoogleSettings, ResolvedConfig};
use crate::credentials::CredentialStore;
use crate::domain::{Form, FormPolicy, Instance, InstanceId, InstanceStatus};
use crate::downloader::HttpFormDownloader;
use crate::error::SyncError;
use crate::form_source::{HttpFormListing, ServerFormSource};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::reconcile::CatalogReconciler;
use crate::repository::{
    FormsRepository, InstancesRepository, JsonFormsRepository, JsonInstancesRepository,
    NewInstance,
};
use crate::store::Store;
use crate::submit::{InstanceSubmitter, SubmissionContext, SubmissionResult, SubmissionSettings};
use crate::task::UploadTask;
use crate::upload::{
    AccountsManager, BackendProvider, InstanceUploader, ServerUploader, SheetsApi,
    SpreadsheetUploader,
};

#[derive(Debug, Clone, Serialize)]
pub struct FormListResult {
    pub forms: Vec<FormEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormEntry {
    pub record_id: u64,
    pub form_id: String,
    pub version: Option<String>,
    pub name: String,
    pub hash: String,
    pub auto_send: FormPolicy,
    pub auto_delete: FormPolicy,
    pub submission_uri: Option<String>,
    pub path: String,
}

impl From<Form> for FormEntry {
    fn from(form: Form) -> Self {
        Self {
            record_id: form.id.get(),
            form_id: form.form_id,
            version: form.version,
            name: form.display_name,
            hash: form.hash,
            auto_send: form.auto_send,
            auto_delete: form.auto_delete,
            submission_uri: form.submission_uri,
            path: form.definition_path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub elapsed_ms: u64,
    pub forms: Vec<FormEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceListResult {
    pub instances: Vec<InstanceEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceEntry {
    pub id: InstanceId,
    pub form_id: String,
    pub form_version: Option<String>,
    pub name: String,
    pub status: InstanceStatus,
    pub last_status_changed_at: String,
    pub deleted: bool,
}

impl From<Instance> for InstanceEntry {
    fn from(instance: Instance) -> Self {
        Self {
            deleted: instance.is_deleted(),
            id: instance.id,
            form_id: instance.form_id,
            form_version: instance.form_version,
            name: instance.display_name,
            status: instance.status,
            last_status_changed_at: instance.last_status_changed_at.to_rfc3339(),
        }
    }
}

/// Account selection backed by the `google` section of the config file.
pub struct ConfiguredAccounts {
    settings: GoogleSettings,
    selected: Mutex<Option<String>>,
}

impl ConfiguredAccounts {
    pub fn new(settings: GoogleSettings) -> Self {
        let selected = settings.selected_account.clone();
        Self {
            settings,
            selected: Mutex::new(selected),
        }
    }

    pub fn selected(&self) -> Option<String> {
        self.selected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AccountsManager for ConfiguredAccounts {
    fn is_account_permission_granted(&self) -> bool {
        self.settings.account_permission
    }

    fn last_selected_account_if_valid(&self) -> Option<String> {
        self.selected()
            .filter(|account| account.contains('@') && !account.trim().is_empty())
    }

    fn select_account(&self, account: &str) {
        *self
            .selected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(account.to_string());
    }
}

/// Uploaders for the command line: OpenRosa over HTTP, plus a spreadsheet client when one
/// is plugged in.
#[derive(Clone)]
pub struct DefaultBackends {
    default_url: String,
    credentials: CredentialStore,
    sheets: Option<Arc<dyn SheetsApi>>,
}

impl DefaultBackends {
    pub fn new(default_url: impl Into<String>, credentials: CredentialStore) -> Self {
        Self {
            default_url: default_url.into(),
            credentials,
            sheets: None,
        }
    }

    pub fn with_sheets(mut self, sheets: Arc<dyn SheetsApi>) -> Self {
        self.sheets = Some(sheets);
        self
    }
}

impl BackendProvider for DefaultBackends {
    fn server_uploader(&self) -> Result<Box<dyn InstanceUploader>, SyncError> {
        Ok(Box::new(ServerUploader::new(
            self.default_url.clone(),
            self.credentials.clone(),
        )?))
    }

    fn spreadsheet_uploader(&self, account: &str) -> Result<Box<dyn InstanceUploader>, SyncError> {
        let sheets = self.sheets.clone().ok_or(SyncError::SpreadsheetUnavailable)?;
        Ok(Box::new(SpreadsheetUploader::new(sheets, account)))
    }
}

/// Wires the file-backed repositories and HTTP collaborators behind each command.
pub struct App {
    config: ResolvedConfig,
    store: Store,
    credentials: CredentialStore,
    forms: Arc<dyn FormsRepository>,
    instances: Arc<dyn InstancesRepository>,
    accounts: Arc<ConfiguredAccounts>,
    backends: Arc<dyn BackendProvider>,
}

impl App {
    pub fn new(config: ResolvedConfig, store: Store) -> Self {
        let credentials = CredentialStore::new();
        if let Some(server_credentials) = &config.server_credentials {
            credentials.save(&config.server_url, server_credentials.clone());
        }
        let backends = Arc::new(DefaultBackends::new(
            config.default_submission_url(),
            credentials.clone(),
        ));
        Self {
            forms: Arc::new(JsonFormsRepository::new(store.clone())),
            instances: Arc::new(JsonInstancesRepository::new(store.clone())),
            accounts: Arc::new(ConfiguredAccounts::new(config.google.clone())),
            backends,
            credentials,
            config,
            store,
        }
    }

    /// Uses the store root from the config when present, the user data directory otherwise.
    pub fn from_config(config: ResolvedConfig) -> Result<Self, SyncError> {
        let store = match &config.store_root {
            Some(root) => Store::new_with_root(root.clone()),
            None => Store::new()?,
        };
        store.ensure_root()?;
        Ok(Self::new(config, store))
    }

    pub fn with_backends(mut self, backends: Arc<dyn BackendProvider>) -> Self {
        self.backends = backends;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn forms(&self) -> Arc<dyn FormsRepository> {
        self.forms.clone()
    }

    pub fn instances(&self) -> Arc<dyn InstancesRepository> {
        self.instances.clone()
    }

    pub fn sync_forms(
        &self,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        sink.event(ProgressEvent::new(format!(
            "phase=Fetch; {}",
            self.config.form_list_url
        )));
        let listing = HttpFormListing::new(&self.config.form_list_url, self.credentials.clone())?;
        let source = ServerFormSource::new(listing, self.forms.clone());
        let downloader = HttpFormDownloader::new(
            self.store.clone(),
            self.forms.clone(),
            self.credentials.clone(),
        )?;
        CatalogReconciler::new(source, downloader, self.forms.clone(), self.instances.clone())
            .synchronize(sink, cancel)?;

        let elapsed = started.elapsed();
        sink.event(ProgressEvent {
            message: "phase=Done; catalog synchronized".to_string(),
            elapsed: Some(elapsed),
        });
        Ok(SyncResult {
            elapsed_ms: elapsed.as_millis() as u64,
            forms: self.list_forms()?.forms,
        })
    }

    pub fn list_forms(&self) -> Result<FormListResult, SyncError> {
        Ok(FormListResult {
            forms: self.forms.get_all()?.into_iter().map(FormEntry::from).collect(),
        })
    }

    pub fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<InstanceListResult, SyncError> {
        let instances = match status {
            Some(status) => self.instances.get_all_by_status(&[status])?,
            None => self.instances.get_all()?,
        };
        Ok(InstanceListResult {
            instances: instances.into_iter().map(InstanceEntry::from).collect(),
        })
    }

    /// Records a filled-in submission for a downloaded form.
    pub fn import_instance(
        &self,
        form_id: &str,
        version: Option<&str>,
        submission: &Utf8Path,
        status: InstanceStatus,
    ) -> Result<Instance, SyncError> {
        let form = self
            .forms
            .get_latest_by_form_id_and_version(form_id, version)?
            .ok_or_else(|| {
                SyncError::Repository(format!(
                    "form {form_id} version {} is not on this device",
                    version.unwrap_or("-")
                ))
            })?;
        let content = fs::read(submission.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("{submission}: {err}")))?;
        let display_name = submission
            .file_stem()
            .map(str::to_string)
            .unwrap_or_else(|| form.display_name.clone());
        let instance = self.instances.insert(
            NewInstance {
                form_id: form.form_id.clone(),
                form_version: form.version.clone(),
                display_name,
                status,
                submission_uri: form.submission_uri.clone(),
            },
            &content,
        )?;
        info!(instance = %instance.id, form_id = %form.form_id, "instance imported");
        Ok(instance)
    }

    pub fn submitter(&self) -> InstanceSubmitter {
        InstanceSubmitter::new(SubmissionContext {
            forms: self.forms.clone(),
            instances: self.instances.clone(),
            backends: self.backends.clone(),
            accounts: self.accounts.clone(),
            settings: SubmissionSettings::from(&self.config),
        })
    }

    pub fn upload_task(&self) -> UploadTask {
        UploadTask::new(
            self.submitter(),
            self.credentials.clone(),
            self.config.default_submission_url(),
        )
    }

    pub fn auto_send(&self) -> Result<SubmissionResult, SyncError> {
        self.submitter().submit_unsubmitted_instances()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_require_an_address() {
        let accounts = ConfiguredAccounts::new(GoogleSettings {
            account_permission: true,
            selected_account: Some("not-an-account".to_string()),
        });
        assert_eq!(accounts.last_selected_account_if_valid(), None);

        accounts.select_account("collector@example.org");
        assert_eq!(
            accounts.last_selected_account_if_valid().as_deref(),
            Some("collector@example.org")
        );
    }
}
