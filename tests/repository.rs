use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use fieldsync::domain::{FormPolicy, InstanceStatus};
use fieldsync::error::SyncError;
use fieldsync::repository::{
    FormDeleter, FormsRepository, InstancesRepository, JsonFormsRepository,
    JsonInstancesRepository, NewForm, NewInstance, SUBMISSION_FILE_NAME,
};
use fieldsync::store::Store;

fn temp_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, Store::new_with_root(root))
}

fn new_form(store: &Store, form_id: &str, version: Option<&str>) -> NewForm {
    NewForm {
        form_id: form_id.to_string(),
        version: version.map(str::to_string),
        display_name: format!("{form_id} form"),
        definition_path: store.form_definition_path(form_id, version),
        media_dir: store.form_media_dir(form_id, version),
        hash: "sha256:00".to_string(),
        submission_uri: None,
        auto_send: FormPolicy::Inherit,
        auto_delete: FormPolicy::Inherit,
    }
}

fn new_instance(form_id: &str, version: Option<&str>, status: InstanceStatus) -> NewInstance {
    NewInstance {
        form_id: form_id.to_string(),
        form_version: version.map(str::to_string),
        display_name: format!("{form_id} entry"),
        status,
        submission_uri: None,
    }
}

#[test]
fn form_records_round_trip_through_store() {
    let (_dir, store) = temp_store();
    let forms = JsonFormsRepository::new(store.clone());

    let first = forms.insert(new_form(&store, "household", Some("1"))).unwrap();
    let second = forms.insert(new_form(&store, "household", Some("2"))).unwrap();
    forms.insert(new_form(&store, "water", None)).unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(forms.get_all().unwrap().len(), 3);
    assert_eq!(forms.get_all_by_form_id("household").unwrap().len(), 2);
    assert_eq!(
        forms
            .get_latest_by_form_id_and_version("household", Some("2"))
            .unwrap()
            .map(|form| form.id),
        Some(second.id)
    );
    assert!(
        forms
            .get_latest_by_form_id_and_version("water", None)
            .unwrap()
            .is_some()
    );
    assert!(
        forms
            .get_latest_by_form_id_and_version("water", Some("1"))
            .unwrap()
            .is_none()
    );

    let mut updated = first.clone();
    updated.auto_send = FormPolicy::On;
    forms.update(&updated).unwrap();
    assert_eq!(forms.get(first.id).unwrap().unwrap().auto_send, FormPolicy::On);
}

#[test]
fn ids_are_not_reused_after_delete() {
    let (_dir, store) = temp_store();
    let forms = JsonFormsRepository::new(store.clone());
    let first = forms.insert(new_form(&store, "a", None)).unwrap();
    forms.delete(first.id).unwrap();
    let second = forms.insert(new_form(&store, "b", None)).unwrap();
    assert!(second.id > first.id);
    assert!(forms.get(first.id).unwrap().is_none());
}

#[test]
fn instance_insert_writes_submission_file() {
    let (_dir, store) = temp_store();
    let instances = JsonInstancesRepository::new(store);
    let instance = instances
        .insert(
            new_instance("household", Some("1"), InstanceStatus::Complete),
            b"<data id=\"household\"/>",
        )
        .unwrap();

    assert!(instance.submission_file.ends_with(SUBMISSION_FILE_NAME));
    assert_eq!(
        std::fs::read_to_string(instance.submission_file.as_std_path()).unwrap(),
        "<data id=\"household\"/>"
    );
    assert_eq!(
        instances
            .get_count_by_status(&InstanceStatus::SENDABLE)
            .unwrap(),
        1
    );
}

#[test]
fn status_changes_follow_the_state_machine() {
    let (_dir, store) = temp_store();
    let instances = JsonInstancesRepository::new(store);
    let draft = instances
        .insert(new_instance("f", None, InstanceStatus::Incomplete), b"<d/>")
        .unwrap();

    let err = instances
        .set_status(draft.id, InstanceStatus::Submitted)
        .unwrap_err();
    assert_matches!(err, SyncError::Repository(_));

    instances.set_status(draft.id, InstanceStatus::Complete).unwrap();
    instances
        .set_status(draft.id, InstanceStatus::SubmissionFailed)
        .unwrap();
    let sent = instances
        .set_status(draft.id, InstanceStatus::Submitted)
        .unwrap();
    assert_eq!(sent.status, InstanceStatus::Submitted);

    // Already submitted: re-applying is a no-op, going back is not allowed.
    instances.set_status(draft.id, InstanceStatus::Submitted).unwrap();
    assert_matches!(
        instances.set_status(draft.id, InstanceStatus::Complete),
        Err(SyncError::Repository(_))
    );

    assert_matches!(
        instances.set_status(fieldsync::domain::InstanceId::new(42), InstanceStatus::Complete),
        Err(SyncError::InstanceNotFound(_))
    );
}

#[test]
fn soft_delete_keeps_the_record() {
    let (_dir, store) = temp_store();
    let instances = JsonInstancesRepository::new(store);
    let instance = instances
        .insert(new_instance("f", None, InstanceStatus::Complete), b"<d/>")
        .unwrap();

    instances.soft_delete(instance.id).unwrap();

    let record = instances.get(instance.id).unwrap().unwrap();
    assert!(record.is_deleted());
    assert!(!instance.instance_dir.as_std_path().exists());

    instances.delete(instance.id).unwrap();
    assert!(instances.get(instance.id).unwrap().is_none());
}

#[test]
fn form_deleter_cascades_to_matching_version_only() {
    let (_dir, store) = temp_store();
    let forms = JsonFormsRepository::new(store.clone());
    let instances = JsonInstancesRepository::new(store.clone());
    let v1 = forms.insert(new_form(&store, "household", Some("1"))).unwrap();
    forms.insert(new_form(&store, "household", Some("2"))).unwrap();
    std::fs::create_dir_all(v1.media_dir.as_std_path()).unwrap();
    std::fs::write(v1.definition_path.as_std_path(), "<h:html/>").unwrap();

    let old = instances
        .insert(new_instance("household", Some("1"), InstanceStatus::Complete), b"<d/>")
        .unwrap();
    let current = instances
        .insert(new_instance("household", Some("2"), InstanceStatus::Complete), b"<d/>")
        .unwrap();

    FormDeleter::new(&forms, &instances).delete(v1.id).unwrap();

    assert!(forms.get(v1.id).unwrap().is_none());
    assert!(!v1.definition_path.as_std_path().exists());
    assert!(!v1.media_dir.as_std_path().exists());
    assert!(instances.get(old.id).unwrap().is_none());
    assert!(instances.get(current.id).unwrap().is_some());
    assert_eq!(forms.get_all_by_form_id("household").unwrap().len(), 1);
}
