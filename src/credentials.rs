use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::Url;
use tracing::debug;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    by_host: Arc<Mutex<HashMap<String, Credentials>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, url: &str, credentials: Credentials) {
        if let Some(host) = host_key(url) {
            debug!(host = %host, "saving credentials");
            self.lock().insert(host, credentials);
        }
    }

    pub fn clear(&self, url: &str) {
        if let Some(host) = host_key(url) {
            debug!(host = %host, "clearing credentials");
            self.lock().remove(&host);
        }
    }

    pub fn get(&self, url: &str) -> Option<Credentials> {
        let host = host_key(url)?;
        self.lock().get(&host).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Credentials>> {
        self.by_host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn host_key(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// Credentials supplied for a single run against one destination.
#[derive(Debug)]
pub struct TemporaryCredentials {
    store: CredentialStore,
    destination: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl TemporaryCredentials {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            destination: None,
            username: None,
            password: None,
        }
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn is_explicit(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn set_destination(&mut self, url: impl Into<String>, apply: bool) {
        self.release();
        self.destination = Some(url.into());
        if apply {
            self.apply();
        }
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = Some(username.into());
        self.apply();
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(password.into());
        self.apply();
    }

    fn apply(&self) {
        let Some(destination) = self.destination.as_deref() else {
            return;
        };
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => self
                .store
                .save(destination, Credentials::new(username, password)),
            _ => self.store.clear(destination),
        }
    }

    pub fn release(&mut self) {
        if !self.is_explicit() {
            return;
        }
        if let Some(destination) = self.destination.as_deref() {
            self.store.clear(destination);
        }
    }
}

impl Drop for TemporaryCredentials {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_includes_port() {
        assert_eq!(
            host_key("https://Example.org/submission").as_deref(),
            Some("example.org")
        );
        assert_eq!(
            host_key("http://10.0.0.2:8080/x").as_deref(),
            Some("10.0.0.2:8080")
        );
        assert_eq!(host_key("not a url"), None);
    }

    #[test]
    fn credentials_are_shared_per_host() {
        let store = CredentialStore::new();
        store.save("https://example.org/a", Credentials::new("u", "p"));
        assert_eq!(
            store.get("https://example.org/b"),
            Some(Credentials::new("u", "p"))
        );
        assert_eq!(store.get("https://other.org/"), None);
    }

    #[test]
    fn debug_hides_password() {
        let rendered = format!("{:?}", Credentials::new("alice", "secret"));
        assert!(!rendered.contains("secret"));
    }
}
