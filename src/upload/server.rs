use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::credentials::{CredentialStore, host_key};
use crate::domain::Instance;
use crate::error::{SyncError, UploadError};
use crate::fs_util;
use crate::http;
use crate::upload::InstanceUploader;

const SUBMISSION_PART: &str = "xml_submission_file";

/// OpenRosa-style submission to an aggregation server.
#[derive(Clone)]
pub struct ServerUploader {
    client: Client,
    credentials: CredentialStore,
    default_url: String,
}

impl ServerUploader {
    pub fn new(
        default_url: impl Into<String>,
        credentials: CredentialStore,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(120))?,
            credentials,
            default_url: default_url.into(),
        })
    }

    fn probe(&self, url: &str) -> Result<(), UploadError> {
        let response = http::with_credentials(self.client.head(url), &self.credentials, url)
            .send()
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(auth_requested(url)),
            StatusCode::NO_CONTENT => Ok(()),
            status if status.is_success() => Err(UploadError::Rejected(format!(
                "Failed to send to {url}. Is this an OpenRosa submission URL?"
            ))),
            // Servers that do not implement HEAD still take the POST.
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(status_error(status, response)),
        }
    }

    fn multipart(&self, instance: &Instance) -> Result<Form, UploadError> {
        let submission = Part::file(instance.submission_file.as_std_path())
            .map_err(|err| UploadError::Filesystem(err.to_string()))?
            .mime_str("text/xml")
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;
        let mut form = Form::new().part(SUBMISSION_PART, submission);
        let attachments = fs_util::list_files(&instance.instance_dir, &instance.submission_file)
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;
        for path in attachments {
            let name = path.file_name().unwrap_or("attachment").to_string();
            let part = Part::file(path.as_std_path())
                .map_err(|err| UploadError::Filesystem(err.to_string()))?;
            form = form.part(name, part);
        }
        Ok(form)
    }
}

impl InstanceUploader for ServerUploader {
    fn url_to_submit_to(
        &self,
        instance: &Instance,
        device_id: Option<&str>,
        override_url: Option<&str>,
        extra_params: Option<&BTreeMap<String, String>>,
    ) -> Result<String, UploadError> {
        let base = override_url
            .or(instance.submission_uri.as_deref())
            .unwrap_or(&self.default_url)
            .trim();
        let mut url = Url::parse(base)
            .map_err(|err| UploadError::InvalidDestination(format!("{base}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UploadError::InvalidDestination(base.to_string()));
        }
        {
            let mut query = url.query_pairs_mut();
            if let Some(device_id) = device_id {
                query.append_pair("deviceID", device_id);
            }
            for (key, value) in extra_params.into_iter().flatten() {
                query.append_pair(key, value);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url.to_string())
    }

    fn upload_one_submission(
        &self,
        instance: &Instance,
        url: &str,
    ) -> Result<Option<String>, UploadError> {
        self.probe(url)?;
        let form = self.multipart(instance)?;
        debug!(instance = %instance.id, url, "posting submission");
        let response = http::with_credentials(self.client.post(url), &self.credentials, url)
            .multipart(form)
            .send()
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                let body = response.text().unwrap_or_default();
                Ok(open_rosa_message(&body))
            }
            StatusCode::UNAUTHORIZED => Err(auth_requested(url)),
            status => Err(status_error(status, response)),
        }
    }
}

fn auth_requested(url: &str) -> UploadError {
    UploadError::AuthRequested {
        host: host_key(url).unwrap_or_else(|| url.to_string()),
    }
}

fn status_error(status: StatusCode, response: Response) -> UploadError {
    let body = response.text().unwrap_or_default();
    let message = open_rosa_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .map(|reason| format!("{reason} ({})", status.as_u16()))
            .unwrap_or_default()
    });
    UploadError::ServerStatus {
        status: status.as_u16(),
        message,
    }
}

/// Text of the `<message>` element of an OpenRosa response, if any.
pub fn open_rosa_message(body: &str) -> Option<String> {
    static MESSAGE: OnceLock<Regex> = OnceLock::new();
    let re = MESSAGE.get_or_init(|| {
        Regex::new(r"(?s)<message[^>]*>(.*?)</message>").expect("message pattern is valid")
    });
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|value| value.as_str().trim().to_string())
        .filter(|message| !message.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_open_rosa_message() {
        let body = r#"<OpenRosaResponse xmlns="http://openrosa.org/http/response">
            <message nature="submit_success">  Thanks for your submission. </message>
        </OpenRosaResponse>"#;
        assert_eq!(
            open_rosa_message(body).as_deref(),
            Some("Thanks for your submission.")
        );
        assert_eq!(open_rosa_message("<OpenRosaResponse/>"), None);
        assert_eq!(open_rosa_message("<message></message>"), None);
    }
}
