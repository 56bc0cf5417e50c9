use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{Instance, InstanceId, InstanceStatus, Protocol};
use crate::error::{SyncError, UploadError};
use crate::repository::{FormsRepository, InstancesRepository};
use crate::upload::{AccountsManager, BackendProvider, UploadBackend, resolve_backend};

pub const DEFAULT_SUCCESS_MESSAGE: &str = "Success";
pub const NOT_FINALIZED_MESSAGE: &str = "Instance is not finalized and cannot be sent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionSettings {
    pub protocol: Protocol,
    pub auto_send: bool,
    pub delete_after_send: bool,
    pub device_id: String,
}

impl From<&ResolvedConfig> for SubmissionSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            protocol: config.protocol,
            auto_send: config.auto_send,
            delete_after_send: config.delete_after_send,
            device_id: config.device_id.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SubmissionContext {
    pub forms: Arc<dyn FormsRepository>,
    pub instances: Arc<dyn InstancesRepository>,
    pub backends: Arc<dyn BackendProvider>,
    pub accounts: Arc<dyn AccountsManager>,
    pub settings: SubmissionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Success(String),
    Failure(String),
}

impl SubmissionOutcome {
    pub fn message(&self) -> &str {
        match self {
            SubmissionOutcome::Success(message) | SubmissionOutcome::Failure(message) => message,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SubmissionOutcome::Failure(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Uploaded { message: String, deleted: bool },
    Failed { message: String },
    Rejected { message: String },
    /// The server wants credentials. Left out of the results so the instance is retried.
    AuthRequested { host: String },
}

impl ItemOutcome {
    pub fn to_submission_outcome(&self) -> Option<SubmissionOutcome> {
        match self {
            ItemOutcome::Uploaded { message, .. } => Some(SubmissionOutcome::Success(message.clone())),
            ItemOutcome::Failed { message } | ItemOutcome::Rejected { message } => {
                Some(SubmissionOutcome::Failure(message.clone()))
            }
            ItemOutcome::AuthRequested { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmissionResult {
    pub any_failure: bool,
    pub outcomes: BTreeMap<InstanceId, SubmissionOutcome>,
    pub auth_requesting_server: Option<String>,
    pub summary: String,
}

#[derive(Debug, Default)]
pub struct OutcomeLog {
    entries: Vec<(InstanceId, ItemOutcome)>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: InstanceId, outcome: ItemOutcome) {
        self.entries.push((id, outcome));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(InstanceId, ItemOutcome)] {
        &self.entries
    }

    pub fn finish(self, instances: &dyn InstancesRepository) -> SubmissionResult {
        let mut result = SubmissionResult::default();
        for (id, outcome) in self.entries {
            match outcome.to_submission_outcome() {
                Some(recorded) => {
                    result.any_failure |= recorded.is_failure();
                    result.outcomes.insert(id, recorded);
                }
                None => {
                    if let ItemOutcome::AuthRequested { host } = outcome {
                        result.auth_requesting_server = Some(host);
                    }
                }
            }
        }
        result.summary = compose_summary(&result.outcomes, instances);
        result
    }
}

pub fn compose_summary(
    outcomes: &BTreeMap<InstanceId, SubmissionOutcome>,
    instances: &dyn InstancesRepository,
) -> String {
    let mut lines = outcomes
        .iter()
        .map(|(id, outcome)| {
            let name = instances
                .get(*id)
                .ok()
                .flatten()
                .map(|instance| instance.display_name)
                .unwrap_or_else(|| format!("Instance {id}"));
            format!("{name} - {}", outcome.message())
        })
        .collect::<Vec<_>>();

    match instances.get_count_by_status(&InstanceStatus::SENDABLE) {
        Ok(0) => {}
        Ok(1) => lines.push("1 form is still waiting to be sent".to_string()),
        Ok(count) => lines.push(format!("{count} forms are still waiting to be sent")),
        Err(err) => warn!(error = %err, "could not count unsent instances"),
    }
    lines.join("\n\n")
}

pub struct SubmissionSession {
    backend: UploadBackend,
    device_id: Option<String>,
    override_url: Option<String>,
    forms: Arc<dyn FormsRepository>,
    instances: Arc<dyn InstancesRepository>,
    delete_after_send: bool,
}

impl SubmissionSession {
    pub fn protocol(&self) -> Protocol {
        self.backend.protocol()
    }

    pub fn instances(&self) -> &dyn InstancesRepository {
        self.instances.as_ref()
    }

    pub fn submit_one(&self, instance: &Instance) -> ItemOutcome {
        if !instance.status.is_sendable() {
            info!(instance = %instance.id, status = %instance.status, "instance not finalized, skipped");
            return ItemOutcome::Rejected {
                message: NOT_FINALIZED_MESSAGE.to_string(),
            };
        }

        let uploader = self.backend.uploader();
        let url = match uploader.url_to_submit_to(
            instance,
            self.device_id.as_deref(),
            self.override_url.as_deref(),
            None,
        ) {
            Ok(url) => url,
            Err(err) if err.is_auth_request() => return self.auth_requested(instance, err),
            Err(err) => return self.failed(instance, err.display_message()),
        };

        if let Err(message) = self.backend.validate_destination(&url) {
            info!(instance = %instance.id, url = %url, "destination rejected by backend");
            return ItemOutcome::Rejected {
                message: message.to_string(),
            };
        }

        match uploader.upload_one_submission(instance, &url) {
            Ok(custom) => {
                // Files stay when the record still says unsent.
                let deleted = self.transition(instance.id, InstanceStatus::Submitted)
                    && self.delete_if_required(instance);
                info!(
                    instance = %instance.id,
                    form_id = %instance.form_id,
                    protocol = %self.protocol(),
                    deleted,
                    "instance uploaded"
                );
                ItemOutcome::Uploaded {
                    message: custom.unwrap_or_else(|| DEFAULT_SUCCESS_MESSAGE.to_string()),
                    deleted,
                }
            }
            Err(err) if err.is_auth_request() => self.auth_requested(instance, err),
            Err(err) => self.failed(instance, err.display_message()),
        }
    }

    fn failed(&self, instance: &Instance, message: String) -> ItemOutcome {
        warn!(instance = %instance.id, error = %message, "instance upload failed");
        self.transition(instance.id, InstanceStatus::SubmissionFailed);
        ItemOutcome::Failed { message }
    }

    fn auth_requested(&self, instance: &Instance, err: UploadError) -> ItemOutcome {
        let host = match err {
            UploadError::AuthRequested { host } => host,
            other => other.to_string(),
        };
        info!(instance = %instance.id, host = %host, "server requested authentication");
        ItemOutcome::AuthRequested { host }
    }

    fn transition(&self, id: InstanceId, status: InstanceStatus) -> bool {
        match self.instances.set_status(id, status) {
            Ok(_) => true,
            Err(err) => {
                warn!(instance = %id, status = %status, error = %err, "status not updated");
                false
            }
        }
    }

    fn delete_if_required(&self, instance: &Instance) -> bool {
        if !should_delete_after_send(self.forms.as_ref(), instance, self.delete_after_send) {
            return false;
        }
        match self.instances.soft_delete(instance.id) {
            Ok(()) => {
                debug!(instance = %instance.id, "instance deleted after send");
                true
            }
            Err(err) => {
                warn!(instance = %instance.id, error = %err, "could not delete sent instance");
                false
            }
        }
    }
}

/// The form's own auto-delete flag wins; without one the app setting applies. Instances
/// whose form is gone are kept.
pub fn should_delete_after_send(
    forms: &dyn FormsRepository,
    instance: &Instance,
    delete_after_send: bool,
) -> bool {
    match forms.get_latest_by_form_id_and_version(&instance.form_id, instance.form_version.as_deref()) {
        Ok(Some(form)) => form.auto_delete.resolve(delete_after_send),
        Ok(None) => false,
        Err(err) => {
            warn!(instance = %instance.id, error = %err, "form lookup failed");
            false
        }
    }
}

pub fn should_form_be_sent(
    forms: &dyn FormsRepository,
    form_id: &str,
    version: Option<&str>,
    auto_send: bool,
) -> Result<bool, SyncError> {
    Ok(forms
        .get_latest_by_form_id_and_version(form_id, version)?
        .map(|form| form.auto_send.resolve(auto_send))
        .unwrap_or(false))
}

pub struct InstanceSubmitter {
    context: SubmissionContext,
}

impl InstanceSubmitter {
    pub fn new(context: SubmissionContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &SubmissionContext {
        &self.context
    }

    pub fn open_session(&self, override_url: Option<String>) -> Result<SubmissionSession, SyncError> {
        let settings = &self.context.settings;
        let (backend, device_id) = resolve_backend(
            settings.protocol,
            self.context.backends.as_ref(),
            self.context.accounts.as_ref(),
            &settings.device_id,
        )?;
        Ok(SubmissionSession {
            backend,
            device_id,
            override_url,
            forms: self.context.forms.clone(),
            instances: self.context.instances.clone(),
            delete_after_send: settings.delete_after_send,
        })
    }

    pub fn submit_selected(&self, instances: &[Instance]) -> Result<SubmissionResult, SyncError> {
        if instances.is_empty() {
            return Err(SyncError::NothingToSubmit);
        }
        let session = self.open_session(None)?;

        let mut log = OutcomeLog::new();
        for instance in instances {
            log.record(instance.id, session.submit_one(instance));
        }
        let result = log.finish(self.context.instances.as_ref());
        info!(
            total = instances.len(),
            recorded = result.outcomes.len(),
            any_failure = result.any_failure,
            "submission batch finished"
        );
        Ok(result)
    }

    pub fn submit_unsubmitted_instances(&self) -> Result<SubmissionResult, SyncError> {
        let instances = self.instances_to_auto_send()?;
        self.submit_selected(&instances)
    }

    pub fn instances_to_auto_send(&self) -> Result<Vec<Instance>, SyncError> {
        let auto_send = self.context.settings.auto_send;
        let mut selected = Vec::new();
        for instance in self
            .context
            .instances
            .get_all_by_status(&InstanceStatus::SENDABLE)?
        {
            if should_form_be_sent(
                self.context.forms.as_ref(),
                &instance.form_id,
                instance.form_version.as_deref(),
                auto_send,
            )? {
                selected.push(instance);
            }
        }
        Ok(selected)
    }
}
