use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::credentials::{CredentialStore, TemporaryCredentials};
use crate::domain::{Instance, InstanceId};
use crate::error::SyncError;
use crate::repository::InstancesRepository;
use crate::submit::{InstanceSubmitter, OutcomeLog, SubmissionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Progress { processed: usize, total: usize },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadTaskOutcome {
    #[serde(flatten)]
    pub result: SubmissionResult,
    pub cancelled: bool,
}

/// Runs a submission batch on a worker thread.
pub struct UploadTask {
    submitter: InstanceSubmitter,
    credentials: TemporaryCredentials,
    destination_url: Option<String>,
    default_destination: String,
}

impl UploadTask {
    pub fn new(
        submitter: InstanceSubmitter,
        credentials: CredentialStore,
        default_destination: impl Into<String>,
    ) -> Self {
        Self {
            submitter,
            credentials: TemporaryCredentials::new(credentials),
            destination_url: None,
            default_destination: default_destination.into(),
        }
    }

    /// Sends every instance of this run to `url` instead of its usual destination.
    pub fn set_destination_url(&mut self, url: impl Into<String>) {
        let url = url.into();
        self.credentials.set_destination(url.clone(), true);
        self.destination_url = Some(url);
    }

    pub fn set_credentials(&mut self, username: impl Into<String>, password: impl Into<String>) {
        if self.credentials.destination().is_none() {
            self.credentials
                .set_destination(self.default_destination.clone(), false);
        }
        self.credentials.set_username(username);
        self.credentials.set_password(password);
    }

    pub fn spawn(self, ids: Vec<InstanceId>) -> UploadTaskHandle {
        self.spawn_with_token(ids, CancellationToken::new())
    }

    pub fn spawn_with_token(self, ids: Vec<InstanceId>, cancel: CancellationToken) -> UploadTaskHandle {
        let (tx, rx) = mpsc::channel();
        let worker_cancel = cancel.clone();
        let handle = thread::spawn(move || self.run(ids, &worker_cancel, &tx));
        UploadTaskHandle {
            events: rx,
            cancel,
            handle,
        }
    }

    fn run(
        self,
        ids: Vec<InstanceId>,
        cancel: &CancellationToken,
        events: &Sender<TaskEvent>,
    ) -> Result<UploadTaskOutcome, SyncError> {
        // Released on every exit path, including early errors.
        let _credentials = self.credentials;
        if ids.is_empty() {
            return Err(SyncError::NothingToSubmit);
        }

        let instances = load_instances(self.submitter.context().instances.as_ref(), &ids)?;
        if instances.is_empty() {
            return Err(SyncError::NothingToSubmit);
        }
        let session = self.submitter.open_session(self.destination_url)?;
        let total = instances.len();

        let mut log = OutcomeLog::new();
        let mut cancelled = false;
        for (index, instance) in instances.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(processed = index, total, "upload task cancelled");
                cancelled = true;
                break;
            }
            log.record(instance.id, session.submit_one(instance));
            // The receiver may already be gone; the run still completes.
            let _ = events.send(TaskEvent::Progress {
                processed: index + 1,
                total,
            });
        }

        Ok(UploadTaskOutcome {
            result: log.finish(session.instances()),
            cancelled,
        })
    }
}

fn load_instances(
    repository: &dyn InstancesRepository,
    ids: &[InstanceId],
) -> Result<Vec<Instance>, SyncError> {
    let mut instances = Vec::with_capacity(ids.len());
    for id in ids {
        match repository.get(*id)? {
            Some(instance) => instances.push(instance),
            None => warn!(instance = %id, "instance missing, skipped"),
        }
    }
    Ok(instances)
}

pub struct UploadTaskHandle {
    events: Receiver<TaskEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<UploadTaskOutcome, SyncError>>,
}

impl UploadTaskHandle {
    /// Stops the run before the next instance. An upload already in flight completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &Receiver<TaskEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<UploadTaskOutcome, SyncError> {
        self.handle
            .join()
            .map_err(|_| SyncError::Worker("upload worker panicked".to_string()))?
    }
}
