use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use reqwest::Url;
use tracing::debug;

use crate::domain::Instance;
use crate::error::UploadError;
use crate::upload::InstanceUploader;

pub const SPREADSHEET_UPLOADED_TO_GOOGLE_DRIVE: &str =
    "Failed. Records can only be submitted to a spreadsheet, not to other kinds of Drive documents.";

fn spreadsheet_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https://docs\.google\.com/spreadsheets/d/([A-Za-z0-9_-]+)")
            .expect("spreadsheet pattern is valid")
    })
}

/// Whether `url` points at a spreadsheet rather than some other cloud document.
pub fn is_spreadsheet_url(url: &str) -> bool {
    spreadsheet_pattern().is_match(url.trim())
}

pub fn spreadsheet_id(url: &str) -> Option<String> {
    spreadsheet_pattern()
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|id| id.as_str().to_string())
}

/// Cloud spreadsheet API, consumed as an external collaborator.
pub trait SheetsApi: Send + Sync {
    /// Appends one submission as a row. `Ok(Some(_))` carries a message to show the user.
    fn append_submission(
        &self,
        spreadsheet_id: &str,
        instance: &Instance,
        submission_xml: &str,
    ) -> Result<Option<String>, UploadError>;
}

impl<T: SheetsApi + ?Sized> SheetsApi for Arc<T> {
    fn append_submission(
        &self,
        spreadsheet_id: &str,
        instance: &Instance,
        submission_xml: &str,
    ) -> Result<Option<String>, UploadError> {
        (**self).append_submission(spreadsheet_id, instance, submission_xml)
    }
}

pub struct SpreadsheetUploader<A: SheetsApi> {
    api: A,
    account: String,
}

impl<A: SheetsApi> SpreadsheetUploader<A> {
    pub fn new(api: A, account: impl Into<String>) -> Self {
        Self {
            api,
            account: account.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }
}

impl<A: SheetsApi> InstanceUploader for SpreadsheetUploader<A> {
    fn url_to_submit_to(
        &self,
        instance: &Instance,
        _device_id: Option<&str>,
        override_url: Option<&str>,
        _extra_params: Option<&BTreeMap<String, String>>,
    ) -> Result<String, UploadError> {
        let url = override_url
            .or(instance.submission_uri.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| UploadError::MissingSubmissionMetadata(instance.form_id.clone()))?;
        Url::parse(url).map_err(|err| UploadError::InvalidDestination(format!("{url}: {err}")))?;
        Ok(url.to_string())
    }

    fn upload_one_submission(
        &self,
        instance: &Instance,
        url: &str,
    ) -> Result<Option<String>, UploadError> {
        let id = spreadsheet_id(url)
            .ok_or_else(|| UploadError::Spreadsheet(SPREADSHEET_UPLOADED_TO_GOOGLE_DRIVE.into()))?;
        let submission = fs::read_to_string(instance.submission_file.as_std_path())
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;
        debug!(instance = %instance.id, account = %self.account, spreadsheet = %id, "appending row");
        self.api.append_submission(&id, instance, &submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_spreadsheets_only() {
        let sheet = "https://docs.google.com/spreadsheets/d/1aB-c_D/edit#gid=0";
        assert!(is_spreadsheet_url(sheet));
        assert_eq!(spreadsheet_id(sheet).as_deref(), Some("1aB-c_D"));

        assert!(!is_spreadsheet_url(
            "https://docs.google.com/document/d/1aB/edit"
        ));
        assert!(!is_spreadsheet_url("https://drive.google.com/file/d/1aB"));
        assert!(!is_spreadsheet_url("http://docs.google.com/spreadsheets/d/1aB"));
    }
}
