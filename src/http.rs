use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::credentials::CredentialStore;
use crate::error::SyncError;

const OPEN_ROSA_VERSION: &str = "1.0";

pub fn build_client(timeout: Duration) -> Result<Client, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("fieldsync/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SyncError::Http(err.to_string()))?,
    );
    headers.insert(
        "X-OpenRosa-Version",
        HeaderValue::from_static(OPEN_ROSA_VERSION),
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| SyncError::Http(err.to_string()))
}

/// Attaches basic credentials stored for the request's destination host.
pub fn with_credentials(
    request: RequestBuilder,
    credentials: &CredentialStore,
    url: &str,
) -> RequestBuilder {
    match credentials.get(url) {
        Some(found) => request.basic_auth(found.username, Some(found.password)),
        None => request,
    }
}

pub fn handle_status(response: Response) -> Result<Response, SyncError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "request failed".to_string());
    Err(SyncError::HttpStatus { status, message })
}

/// Sends an idempotent request, retrying transient failures with linear backoff.
pub fn send_with_retries<F>(mut make_req: F) -> Result<Response, SyncError>
where
    F: FnMut() -> RequestBuilder,
{
    const MAX_RETRIES: usize = 3;
    const BASE_DELAY_MS: u64 = 200;
    let mut attempt = 0usize;
    loop {
        let response = make_req().send();
        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    debug!(status, attempt, "retrying request");
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    debug!(error = %err, attempt, "retrying request");
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Err(SyncError::Http(err.to_string()));
            }
        }
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
