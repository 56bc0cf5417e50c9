use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use fieldsync::cancel::CancellationToken;
use fieldsync::credentials::{CredentialStore, Credentials};
use fieldsync::domain::{Instance, InstanceId, InstanceStatus, Protocol};
use fieldsync::error::{SyncError, UploadError};
use fieldsync::repository::{InstancesRepository, JsonFormsRepository, JsonInstancesRepository, NewInstance};
use fieldsync::store::Store;
use fieldsync::submit::{InstanceSubmitter, SubmissionContext, SubmissionSettings};
use fieldsync::task::{TaskEvent, UploadTask};
use fieldsync::upload::{AccountsManager, BackendProvider, InstanceUploader};

const DEFAULT_URL: &str = "https://example.org/submission";
const OVERRIDE_URL: &str = "https://override.example.org/submission";

/// Records the URL and the credentials visible for it at upload time.
#[derive(Clone)]
struct RecordingUploader {
    credentials: CredentialStore,
    seen: Arc<Mutex<Vec<(String, Option<Credentials>)>>>,
    cancel_after_upload: Option<CancellationToken>,
}

impl InstanceUploader for RecordingUploader {
    fn url_to_submit_to(
        &self,
        instance: &Instance,
        _device_id: Option<&str>,
        override_url: Option<&str>,
        _extra_params: Option<&BTreeMap<String, String>>,
    ) -> Result<String, UploadError> {
        Ok(override_url
            .or(instance.submission_uri.as_deref())
            .unwrap_or(DEFAULT_URL)
            .to_string())
    }

    fn upload_one_submission(
        &self,
        _instance: &Instance,
        url: &str,
    ) -> Result<Option<String>, UploadError> {
        self.seen
            .lock()
            .unwrap()
            .push((url.to_string(), self.credentials.get(url)));
        if let Some(token) = &self.cancel_after_upload {
            token.cancel();
        }
        Ok(None)
    }
}

struct Backends {
    uploader: RecordingUploader,
}

impl BackendProvider for Backends {
    fn server_uploader(&self) -> Result<Box<dyn InstanceUploader>, SyncError> {
        Ok(Box::new(self.uploader.clone()))
    }

    fn spreadsheet_uploader(&self, _account: &str) -> Result<Box<dyn InstanceUploader>, SyncError> {
        Err(SyncError::SpreadsheetUnavailable)
    }
}

struct NoAccounts;

impl AccountsManager for NoAccounts {
    fn is_account_permission_granted(&self) -> bool {
        false
    }

    fn last_selected_account_if_valid(&self) -> Option<String> {
        None
    }

    fn select_account(&self, _account: &str) {}
}

struct Fixture {
    _dir: TempDir,
    forms: Arc<JsonFormsRepository>,
    instances: Arc<JsonInstancesRepository>,
    credentials: CredentialStore,
    seen: Arc<Mutex<Vec<(String, Option<Credentials>)>>>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = Store::new_with_root(root);
        Self {
            forms: Arc::new(JsonFormsRepository::new(store.clone())),
            instances: Arc::new(JsonInstancesRepository::new(store)),
            credentials: CredentialStore::new(),
            seen: Arc::default(),
            _dir: dir,
        }
    }

    fn instances(&self, count: usize) -> Vec<InstanceId> {
        (0..count)
            .map(|index| {
                self.instances
                    .insert(
                        NewInstance {
                            form_id: "survey".to_string(),
                            form_version: None,
                            display_name: format!("entry {index}"),
                            status: InstanceStatus::Complete,
                            submission_uri: None,
                        },
                        b"<data/>",
                    )
                    .unwrap()
                    .id
            })
            .collect()
    }

    fn task(&self, cancel_after_upload: Option<CancellationToken>) -> UploadTask {
        let uploader = RecordingUploader {
            credentials: self.credentials.clone(),
            seen: self.seen.clone(),
            cancel_after_upload,
        };
        let submitter = InstanceSubmitter::new(SubmissionContext {
            forms: self.forms.clone(),
            instances: self.instances.clone(),
            backends: Arc::new(Backends { uploader }),
            accounts: Arc::new(NoAccounts),
            settings: SubmissionSettings {
                protocol: Protocol::Server,
                auto_send: false,
                delete_after_send: false,
                device_id: "fieldsync:test".to_string(),
            },
        });
        UploadTask::new(submitter, self.credentials.clone(), DEFAULT_URL)
    }

    fn seen(&self) -> Vec<(String, Option<Credentials>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[test]
fn reports_progress_after_each_instance() {
    let fixture = Fixture::new();
    let ids = fixture.instances(3);

    let handle = fixture.task(None).spawn(ids.clone());
    let events = handle.events().iter().collect::<Vec<_>>();
    let outcome = handle.join().unwrap();

    assert_eq!(
        events,
        vec![
            TaskEvent::Progress { processed: 1, total: 3 },
            TaskEvent::Progress { processed: 2, total: 3 },
            TaskEvent::Progress { processed: 3, total: 3 },
        ]
    );
    assert!(!outcome.cancelled);
    assert_eq!(outcome.result.outcomes.len(), 3);
    for id in ids {
        assert_eq!(
            fixture.instances.get(id).unwrap().unwrap().status,
            InstanceStatus::Submitted
        );
    }
}

#[test]
fn cancellation_stops_before_next_instance() {
    let fixture = Fixture::new();
    let ids = fixture.instances(3);
    let token = CancellationToken::new();

    let handle = fixture
        .task(Some(token.clone()))
        .spawn_with_token(ids.clone(), token);
    let events = handle.events().iter().collect::<Vec<_>>();
    let outcome = handle.join().unwrap();

    assert!(outcome.cancelled);
    assert_eq!(events, vec![TaskEvent::Progress { processed: 1, total: 3 }]);
    assert_eq!(outcome.result.outcomes.len(), 1);
    assert!(outcome.result.outcomes.contains_key(&ids[0]));
    assert_eq!(
        fixture.instances.get(ids[1]).unwrap().unwrap().status,
        InstanceStatus::Complete
    );
}

#[test]
fn empty_selection_is_nothing_to_submit() {
    let fixture = Fixture::new();
    let err = fixture.task(None).spawn(Vec::new()).join().unwrap_err();
    assert_matches!(err, SyncError::NothingToSubmit);
}

#[test]
fn unknown_ids_are_skipped() {
    let fixture = Fixture::new();
    let ids = fixture.instances(1);

    let handle = fixture.task(None).spawn(vec![ids[0], InstanceId::new(999)]);
    let events = handle.events().iter().collect::<Vec<_>>();
    let outcome = handle.join().unwrap();

    assert_eq!(events, vec![TaskEvent::Progress { processed: 1, total: 1 }]);
    assert_eq!(outcome.result.outcomes.len(), 1);
}

#[test]
fn only_unknown_ids_is_nothing_to_submit() {
    let fixture = Fixture::new();
    fixture
        .credentials
        .save(OVERRIDE_URL, Credentials::new("stale", "stale"));

    let mut task = fixture.task(None);
    task.set_destination_url(OVERRIDE_URL);
    task.set_credentials("alice", "secret");
    let handle = task.spawn(vec![InstanceId::new(998), InstanceId::new(999)]);
    let events = handle.events().iter().collect::<Vec<_>>();

    assert_matches!(handle.join(), Err(SyncError::NothingToSubmit));
    assert!(events.is_empty());
    assert!(fixture.seen().is_empty());
    assert_eq!(fixture.credentials.get(OVERRIDE_URL), None);
}

#[test]
fn explicit_credentials_live_for_the_run_only() {
    let fixture = Fixture::new();
    let ids = fixture.instances(1);

    let mut task = fixture.task(None);
    task.set_destination_url(OVERRIDE_URL);
    task.set_credentials("alice", "secret");
    task.spawn(ids).join().unwrap();

    assert_eq!(
        fixture.seen(),
        vec![(
            OVERRIDE_URL.to_string(),
            Some(Credentials::new("alice", "secret"))
        )]
    );
    assert_eq!(fixture.credentials.get(OVERRIDE_URL), None);
}

#[test]
fn credentials_without_override_target_default_destination() {
    let fixture = Fixture::new();
    let ids = fixture.instances(1);

    let mut task = fixture.task(None);
    task.set_credentials("bob", "hunter2");
    task.spawn(ids).join().unwrap();

    assert_eq!(
        fixture.seen(),
        vec![(DEFAULT_URL.to_string(), Some(Credentials::new("bob", "hunter2")))]
    );
    assert_eq!(fixture.credentials.get(DEFAULT_URL), None);
}

#[test]
fn override_without_credentials_runs_anonymously() {
    let fixture = Fixture::new();
    fixture
        .credentials
        .save(OVERRIDE_URL, Credentials::new("stale", "stale"));
    let ids = fixture.instances(1);

    let mut task = fixture.task(None);
    task.set_destination_url(OVERRIDE_URL);
    task.spawn(ids).join().unwrap();

    assert_eq!(fixture.seen(), vec![(OVERRIDE_URL.to_string(), None)]);
    assert_eq!(fixture.credentials.get(OVERRIDE_URL), None);
}

#[test]
fn configured_credentials_survive_plain_runs() {
    let fixture = Fixture::new();
    fixture
        .credentials
        .save(DEFAULT_URL, Credentials::new("config", "pass"));
    let ids = fixture.instances(1);

    fixture.task(None).spawn(ids).join().unwrap();

    assert_eq!(
        fixture.seen(),
        vec![(DEFAULT_URL.to_string(), Some(Credentials::new("config", "pass")))]
    );
    assert_eq!(
        fixture.credentials.get(DEFAULT_URL),
        Some(Credentials::new("config", "pass"))
    );
}
