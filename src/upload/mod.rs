use std::collections::BTreeMap;

use crate::domain::{Instance, Protocol};
use crate::error::{SyncError, UploadError};

pub mod server;
pub mod spreadsheet;

pub use server::ServerUploader;
pub use spreadsheet::{
    SPREADSHEET_UPLOADED_TO_GOOGLE_DRIVE, SheetsApi, SpreadsheetUploader, is_spreadsheet_url,
};

pub trait InstanceUploader: Send + Sync {
    /// Resolves where `instance` goes: an explicit override wins over the destination
    /// recorded for the instance, which wins over the backend default.
    fn url_to_submit_to(
        &self,
        instance: &Instance,
        device_id: Option<&str>,
        override_url: Option<&str>,
        extra_params: Option<&BTreeMap<String, String>>,
    ) -> Result<String, UploadError>;

    fn upload_one_submission(
        &self,
        instance: &Instance,
        url: &str,
    ) -> Result<Option<String>, UploadError>;
}

pub enum UploadBackend {
    Server(Box<dyn InstanceUploader>),
    Spreadsheet(Box<dyn InstanceUploader>),
}

impl UploadBackend {
    pub fn protocol(&self) -> Protocol {
        match self {
            UploadBackend::Server(_) => Protocol::Server,
            UploadBackend::Spreadsheet(_) => Protocol::Spreadsheet,
        }
    }

    pub fn uploader(&self) -> &dyn InstanceUploader {
        match self {
            UploadBackend::Server(uploader) | UploadBackend::Spreadsheet(uploader) => {
                uploader.as_ref()
            }
        }
    }

    /// Checks a resolved destination before any upload is attempted. Returns the fixed
    /// message to record when the destination is unusable for this backend.
    pub fn validate_destination(&self, url: &str) -> Result<(), &'static str> {
        match self {
            UploadBackend::Server(_) => Ok(()),
            UploadBackend::Spreadsheet(_) if is_spreadsheet_url(url) => Ok(()),
            UploadBackend::Spreadsheet(_) => Err(SPREADSHEET_UPLOADED_TO_GOOGLE_DRIVE),
        }
    }
}

pub trait BackendProvider: Send + Sync {
    fn server_uploader(&self) -> Result<Box<dyn InstanceUploader>, SyncError>;
    fn spreadsheet_uploader(&self, account: &str) -> Result<Box<dyn InstanceUploader>, SyncError>;
}

pub trait AccountsManager: Send + Sync {
    fn is_account_permission_granted(&self) -> bool;
    fn last_selected_account_if_valid(&self) -> Option<String>;
    fn select_account(&self, account: &str);
}

pub fn resolve_backend(
    protocol: Protocol,
    provider: &dyn BackendProvider,
    accounts: &dyn AccountsManager,
    device_id: &str,
) -> Result<(UploadBackend, Option<String>), SyncError> {
    match protocol {
        Protocol::Spreadsheet => {
            if !accounts.is_account_permission_granted() {
                return Err(SyncError::GoogleAccountNotPermitted);
            }
            let account = accounts
                .last_selected_account_if_valid()
                .filter(|account| !account.trim().is_empty())
                .ok_or(SyncError::GoogleAccountNotSet)?;
            accounts.select_account(&account);
            let uploader = provider.spreadsheet_uploader(&account)?;
            Ok((UploadBackend::Spreadsheet(uploader), None))
        }
        Protocol::Server => {
            let uploader = provider.server_uploader()?;
            Ok((UploadBackend::Server(uploader), Some(device_id.to_string())))
        }
    }
}
