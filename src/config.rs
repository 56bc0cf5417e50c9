use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::domain::Protocol;
use crate::error::SyncError;

pub const DEFAULT_SERVER_URL: &str = "https://demo.getodk.org";
pub const DEFAULT_FORM_LIST_PATH: &str = "/formList";
pub const DEFAULT_SUBMISSION_PATH: &str = "/submission";
const AUTO_SEND_OFF: &str = "off";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub form_list_path: Option<String>,
    #[serde(default)]
    pub submission_path: Option<String>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub auto_send: Option<String>,
    #[serde(default)]
    pub delete_after_send: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub google: Option<GoogleSettings>,
    #[serde(default)]
    pub store_root: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GoogleSettings {
    #[serde(default)]
    pub account_permission: bool,
    #[serde(default)]
    pub selected_account: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub server_url: String,
    pub form_list_url: String,
    pub submission_path: String,
    pub protocol: Protocol,
    pub auto_send: bool,
    pub delete_after_send: bool,
    pub server_credentials: Option<Credentials>,
    pub device_id: String,
    pub google: GoogleSettings,
    pub store_root: Option<Utf8PathBuf>,
}

impl ResolvedConfig {
    pub fn default_submission_url(&self) -> String {
        join_url(&self.server_url, &self.submission_path)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("fieldsync.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let server_url = config
            .server_url
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        Url::parse(&server_url)
            .map_err(|err| SyncError::ConfigParse(format!("server_url {server_url}: {err}")))?;

        let form_list_path = config
            .form_list_path
            .unwrap_or_else(|| DEFAULT_FORM_LIST_PATH.to_string());
        let submission_path = config
            .submission_path
            .unwrap_or_else(|| DEFAULT_SUBMISSION_PATH.to_string());

        let auto_send = config
            .auto_send
            .map(|value| !value.trim().eq_ignore_ascii_case(AUTO_SEND_OFF))
            .unwrap_or(false);

        let server_credentials = match (config.username, config.password) {
            (Some(username), Some(password)) if !username.trim().is_empty() => {
                Some(Credentials::new(username.trim(), password))
            }
            _ => None,
        };

        let device_id = config
            .device_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(default_device_id);

        Ok(ResolvedConfig {
            schema_version,
            form_list_url: join_url(&server_url, &form_list_path),
            server_url,
            submission_path,
            protocol: config.protocol.unwrap_or_default(),
            auto_send,
            delete_after_send: config.delete_after_send.unwrap_or(false),
            server_credentials,
            device_id,
            google: config.google.unwrap_or_default(),
            store_root: config.store_root.map(Utf8PathBuf::from),
        })
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn default_device_id() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "device".to_string());
    format!("fieldsync:{user}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(
            join_url("https://example.org/", "/submission"),
            "https://example.org/submission"
        );
        assert_eq!(
            join_url("https://example.org/v1", "formList"),
            "https://example.org/v1/formList"
        );
    }
}
