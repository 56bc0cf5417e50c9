use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::credentials::CredentialStore;
use crate::domain::{DownloadDescriptor, Form, RemoteFormDescriptor};
use crate::error::SyncError;
use crate::http;
use crate::repository::FormsRepository;

/// Remote form listing, annotated against the local catalog.
pub trait FormSource: Send + Sync {
    fn fetch_form_details(&self) -> Result<Vec<RemoteFormDescriptor>, SyncError>;
}

/// One entry of the server's form list document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormListItem {
    pub form_id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    pub download_url: String,
    #[serde(default)]
    pub manifest_url: Option<String>,
}

pub trait FormListing: Send + Sync {
    fn fetch_form_list(&self) -> Result<Vec<FormListItem>, SyncError>;
}

#[derive(Clone)]
pub struct HttpFormListing {
    client: Client,
    url: String,
    credentials: CredentialStore,
}

impl HttpFormListing {
    pub fn new(url: impl Into<String>, credentials: CredentialStore) -> Result<Self, SyncError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(30))?,
            url: url.into(),
            credentials,
        })
    }
}

impl FormListing for HttpFormListing {
    fn fetch_form_list(&self) -> Result<Vec<FormListItem>, SyncError> {
        let response = http::send_with_retries(|| {
            http::with_credentials(self.client.get(&self.url), &self.credentials, &self.url)
        })?;
        let response = http::handle_status(response)?;
        response
            .json::<Vec<FormListItem>>()
            .map_err(|err| SyncError::Http(format!("invalid form list: {err}")))
    }
}

pub struct ServerFormSource<L: FormListing> {
    listing: L,
    forms: Arc<dyn FormsRepository>,
}

impl<L: FormListing> ServerFormSource<L> {
    pub fn new(listing: L, forms: Arc<dyn FormsRepository>) -> Self {
        Self { listing, forms }
    }
}

impl<L: FormListing> FormSource for ServerFormSource<L> {
    fn fetch_form_details(&self) -> Result<Vec<RemoteFormDescriptor>, SyncError> {
        let listing = self
            .listing
            .fetch_form_list()
            .map_err(|err| SyncError::FetchError(err.to_string()))?;
        let local = self
            .forms
            .get_all()
            .map_err(|err| SyncError::FetchError(err.to_string()))?;
        info!(remote = listing.len(), local = local.len(), "fetched form list");
        Ok(describe_remote_forms(listing, &local))
    }
}

/// Flags each listed form as missing from the device or changed relative to it.
pub fn describe_remote_forms(
    listing: Vec<FormListItem>,
    local: &[Form],
) -> Vec<RemoteFormDescriptor> {
    listing
        .into_iter()
        .map(|item| {
            let same_id = local
                .iter()
                .filter(|form| form.form_id == item.form_id)
                .collect::<Vec<_>>();
            let is_not_on_device = same_id.is_empty();
            let is_updated = !is_not_on_device
                && !same_id.iter().any(|form| {
                    form.version == item.version
                        && item.hash.as_ref().is_none_or(|hash| *hash == form.hash)
                });
            RemoteFormDescriptor {
                form_id: item.form_id,
                name: item.name,
                version: item.version,
                hash: item.hash,
                download: DownloadDescriptor {
                    download_url: item.download_url,
                    manifest_url: item.manifest_url,
                },
                is_not_on_device,
                is_updated,
            }
        })
        .collect()
}
