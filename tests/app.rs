use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use fieldsync::app::App;
use fieldsync::config::{Config, ConfigLoader, GoogleSettings};
use fieldsync::credentials::Credentials;
use fieldsync::domain::{FormPolicy, InstanceStatus, Protocol};
use fieldsync::error::SyncError;
use fieldsync::repository::NewForm;

fn app_with(config: Config) -> (TempDir, App) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let config = Config {
        store_root: Some(root.join("store").to_string()),
        ..config
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    (dir, App::from_config(resolved).unwrap())
}

fn add_form(app: &App, form_id: &str) {
    let store = app.store();
    let version = Some("2024.1");
    app.forms()
        .insert(NewForm {
            form_id: form_id.to_string(),
            version: version.map(str::to_string),
            display_name: "Household survey".to_string(),
            definition_path: store.form_definition_path(form_id, version),
            media_dir: store.form_media_dir(form_id, version),
            hash: "sha256:00".to_string(),
            submission_uri: Some("https://example.org/custom".to_string()),
            auto_send: FormPolicy::On,
            auto_delete: FormPolicy::Inherit,
        })
        .unwrap();
}

#[test]
fn configured_credentials_are_registered_for_server() {
    let (_dir, app) = app_with(Config {
        server_url: Some("https://central.example.org".to_string()),
        username: Some("collector".to_string()),
        password: Some("secret".to_string()),
        ..Config::default()
    });
    assert_eq!(
        app.credentials().get("https://central.example.org/submission"),
        Some(Credentials::new("collector", "secret"))
    );
}

#[test]
fn import_and_list_instances() {
    let (dir, app) = app_with(Config::default());
    add_form(&app, "household");
    let submission =
        Utf8PathBuf::from_path_buf(dir.path().join("visit-12.xml")).unwrap();
    std::fs::write(submission.as_std_path(), "<data/>").unwrap();

    let instance = app
        .import_instance("household", Some("2024.1"), &submission, InstanceStatus::Complete)
        .unwrap();
    assert_eq!(instance.display_name, "visit-12");
    assert_eq!(
        instance.submission_uri.as_deref(),
        Some("https://example.org/custom")
    );

    let draft = app
        .import_instance("household", Some("2024.1"), &submission, InstanceStatus::Incomplete)
        .unwrap();

    let all = app.list_instances(None).unwrap();
    assert_eq!(all.instances.len(), 2);
    let complete = app.list_instances(Some(InstanceStatus::Complete)).unwrap();
    assert_eq!(complete.instances.len(), 1);
    assert_eq!(complete.instances[0].id, instance.id);
    assert_ne!(draft.id, instance.id);

    let forms = app.list_forms().unwrap();
    assert_eq!(forms.forms.len(), 1);
    assert_eq!(forms.forms[0].version.as_deref(), Some("2024.1"));

    let eligible = app.submitter().instances_to_auto_send().unwrap();
    assert_eq!(eligible.len(), 1);
}

#[test]
fn import_requires_a_downloaded_form() {
    let (dir, app) = app_with(Config::default());
    let submission = Utf8PathBuf::from_path_buf(dir.path().join("x.xml")).unwrap();
    std::fs::write(submission.as_std_path(), "<data/>").unwrap();

    assert_matches!(
        app.import_instance("unknown", None, &submission, InstanceStatus::Complete),
        Err(SyncError::Repository(_))
    );
}

#[test]
fn spreadsheet_protocol_checks_accounts_then_availability() {
    let (dir, app) = app_with(Config {
        protocol: Some(Protocol::Spreadsheet),
        ..Config::default()
    });
    add_form(&app, "household");
    let submission = Utf8PathBuf::from_path_buf(dir.path().join("row.xml")).unwrap();
    std::fs::write(submission.as_std_path(), "<data/>").unwrap();
    let instance = app
        .import_instance("household", Some("2024.1"), &submission, InstanceStatus::Complete)
        .unwrap();

    assert_matches!(
        app.submitter().submit_selected(&[instance.clone()]),
        Err(SyncError::GoogleAccountNotPermitted)
    );

    let (_dir, app) = app_with(Config {
        protocol: Some(Protocol::Spreadsheet),
        google: Some(GoogleSettings {
            account_permission: true,
            selected_account: Some("collector@example.org".to_string()),
        }),
        ..Config::default()
    });
    assert_matches!(
        app.submitter().submit_selected(&[instance]),
        Err(SyncError::SpreadsheetUnavailable)
    );
}
