use std::fs;

use camino::Utf8PathBuf;
use chrono::Utc;
use tracing::{debug, info};

use crate::domain::{Form, FormPolicy, FormRecordId, Instance, InstanceId, InstanceStatus};
use crate::error::SyncError;
use crate::store::Store;

const FORM_COUNTER: &str = "forms";
const INSTANCE_COUNTER: &str = "instances";
pub const SUBMISSION_FILE_NAME: &str = "submission.xml";

#[derive(Debug, Clone)]
pub struct NewForm {
    pub form_id: String,
    pub version: Option<String>,
    pub display_name: String,
    pub definition_path: Utf8PathBuf,
    pub media_dir: Utf8PathBuf,
    pub hash: String,
    pub submission_uri: Option<String>,
    pub auto_send: FormPolicy,
    pub auto_delete: FormPolicy,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub form_id: String,
    pub form_version: Option<String>,
    pub display_name: String,
    pub status: InstanceStatus,
    pub submission_uri: Option<String>,
}

pub trait FormsRepository: Send + Sync {
    fn get(&self, id: FormRecordId) -> Result<Option<Form>, SyncError>;
    fn get_all(&self) -> Result<Vec<Form>, SyncError>;
    fn get_all_by_form_id(&self, form_id: &str) -> Result<Vec<Form>, SyncError>;
    fn get_latest_by_form_id_and_version(
        &self,
        form_id: &str,
        version: Option<&str>,
    ) -> Result<Option<Form>, SyncError>;
    fn insert(&self, form: NewForm) -> Result<Form, SyncError>;
    fn update(&self, form: &Form) -> Result<(), SyncError>;
    fn delete(&self, id: FormRecordId) -> Result<(), SyncError>;
}

pub trait InstancesRepository: Send + Sync {
    fn get(&self, id: InstanceId) -> Result<Option<Instance>, SyncError>;
    fn get_all(&self) -> Result<Vec<Instance>, SyncError>;
    fn get_all_by_status(&self, statuses: &[InstanceStatus]) -> Result<Vec<Instance>, SyncError>;
    fn get_count_by_status(&self, statuses: &[InstanceStatus]) -> Result<usize, SyncError>;
    fn get_all_by_form_id(&self, form_id: &str) -> Result<Vec<Instance>, SyncError>;
    fn insert(&self, instance: NewInstance, submission: &[u8]) -> Result<Instance, SyncError>;
    /// Moves an instance along the status state machine, rejecting illegal transitions.
    /// Re-applying the current status is a no-op, except for `SubmissionFailed` which
    /// restamps the change time.
    fn set_status(&self, id: InstanceId, status: InstanceStatus) -> Result<Instance, SyncError>;
    fn delete(&self, id: InstanceId) -> Result<(), SyncError>;
    fn soft_delete(&self, id: InstanceId) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub struct JsonFormsRepository {
    store: Store,
}

impl JsonFormsRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl FormsRepository for JsonFormsRepository {
    fn get(&self, id: FormRecordId) -> Result<Option<Form>, SyncError> {
        Store::read_json(&self.store.form_record_path(id))
    }

    fn get_all(&self) -> Result<Vec<Form>, SyncError> {
        let mut forms: Vec<Form> = Store::list_json(&self.store.form_records_dir())?;
        forms.sort_by_key(|form| form.id);
        Ok(forms)
    }

    fn get_all_by_form_id(&self, form_id: &str) -> Result<Vec<Form>, SyncError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|form| form.form_id == form_id)
            .collect())
    }

    fn get_latest_by_form_id_and_version(
        &self,
        form_id: &str,
        version: Option<&str>,
    ) -> Result<Option<Form>, SyncError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|form| form.matches(form_id, version))
            .max_by_key(|form| (form.downloaded_at, form.id)))
    }

    fn insert(&self, form: NewForm) -> Result<Form, SyncError> {
        let id = FormRecordId::new(self.store.next_id(FORM_COUNTER)?);
        let record = Form {
            id,
            form_id: form.form_id,
            version: form.version,
            display_name: form.display_name,
            definition_path: form.definition_path,
            media_dir: form.media_dir,
            hash: form.hash,
            submission_uri: form.submission_uri,
            auto_send: form.auto_send,
            auto_delete: form.auto_delete,
            downloaded_at: Utc::now(),
        };
        Store::write_json(&self.store.form_record_path(id), &record)?;
        debug!(id = %id, form_id = %record.form_id, "form record inserted");
        Ok(record)
    }

    fn update(&self, form: &Form) -> Result<(), SyncError> {
        let path = self.store.form_record_path(form.id);
        if !path.as_std_path().exists() {
            return Err(SyncError::Repository(format!("form {} not found", form.id)));
        }
        Store::write_json(&path, form)
    }

    fn delete(&self, id: FormRecordId) -> Result<(), SyncError> {
        let Some(form) = self.get(id)? else {
            return Ok(());
        };
        Store::remove_file_if_exists(&form.definition_path)?;
        Store::remove_dir_if_exists(&form.media_dir)?;
        if let Some(parent) = form.definition_path.parent() {
            // Only succeeds once the form directory is empty.
            let _ = fs::remove_dir(parent.as_std_path());
        }
        Store::remove_file_if_exists(&self.store.form_record_path(id))
    }
}

#[derive(Debug, Clone)]
pub struct JsonInstancesRepository {
    store: Store,
}

impl JsonInstancesRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn require(&self, id: InstanceId) -> Result<Instance, SyncError> {
        self.get(id)?.ok_or(SyncError::InstanceNotFound(id))
    }
}

impl InstancesRepository for JsonInstancesRepository {
    fn get(&self, id: InstanceId) -> Result<Option<Instance>, SyncError> {
        Store::read_json(&self.store.instance_record_path(id))
    }

    fn get_all(&self) -> Result<Vec<Instance>, SyncError> {
        let mut instances: Vec<Instance> = Store::list_json(&self.store.instance_records_dir())?;
        instances.sort_by_key(|instance| instance.id);
        Ok(instances)
    }

    fn get_all_by_status(&self, statuses: &[InstanceStatus]) -> Result<Vec<Instance>, SyncError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|instance| statuses.contains(&instance.status))
            .collect())
    }

    fn get_count_by_status(&self, statuses: &[InstanceStatus]) -> Result<usize, SyncError> {
        Ok(self.get_all_by_status(statuses)?.len())
    }

    fn get_all_by_form_id(&self, form_id: &str) -> Result<Vec<Instance>, SyncError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|instance| instance.form_id == form_id)
            .collect())
    }

    fn insert(&self, instance: NewInstance, submission: &[u8]) -> Result<Instance, SyncError> {
        let id = InstanceId::new(self.store.next_id(INSTANCE_COUNTER)?);
        let instance_dir = self.store.instance_dir(id);
        let submission_file = instance_dir.join(SUBMISSION_FILE_NAME);
        Store::write_bytes_atomic(&submission_file, submission)?;

        let record = Instance {
            id,
            form_id: instance.form_id,
            form_version: instance.form_version,
            display_name: instance.display_name,
            status: instance.status,
            instance_dir,
            submission_file,
            submission_uri: instance.submission_uri,
            last_status_changed_at: Utc::now(),
            deleted_at: None,
        };
        Store::write_json(&self.store.instance_record_path(id), &record)?;
        debug!(id = %id, form_id = %record.form_id, "instance record inserted");
        Ok(record)
    }

    fn set_status(&self, id: InstanceId, status: InstanceStatus) -> Result<Instance, SyncError> {
        let mut instance = self.require(id)?;
        if instance.status == status && status != InstanceStatus::SubmissionFailed {
            return Ok(instance);
        }
        if !instance.status.can_transition_to(status) {
            return Err(SyncError::Repository(format!(
                "instance {id}: illegal status transition {} -> {status}",
                instance.status
            )));
        }
        instance.status = status;
        instance.last_status_changed_at = Utc::now();
        Store::write_json(&self.store.instance_record_path(id), &instance)?;
        Ok(instance)
    }

    fn delete(&self, id: InstanceId) -> Result<(), SyncError> {
        if let Some(instance) = self.get(id)? {
            Store::remove_dir_if_exists(&instance.instance_dir)?;
        }
        Store::remove_file_if_exists(&self.store.instance_record_path(id))
    }

    fn soft_delete(&self, id: InstanceId) -> Result<(), SyncError> {
        let mut instance = self.require(id)?;
        Store::remove_dir_if_exists(&instance.instance_dir)?;
        instance.deleted_at = Some(Utc::now());
        Store::write_json(&self.store.instance_record_path(id), &instance)
    }
}

pub struct FormDeleter<'a> {
    forms: &'a dyn FormsRepository,
    instances: &'a dyn InstancesRepository,
}

impl<'a> FormDeleter<'a> {
    pub fn new(forms: &'a dyn FormsRepository, instances: &'a dyn InstancesRepository) -> Self {
        Self { forms, instances }
    }

    pub fn delete(&self, id: FormRecordId) -> Result<(), SyncError> {
        let Some(form) = self.forms.get(id)? else {
            return Ok(());
        };
        let owned = self
            .instances
            .get_all_by_form_id(&form.form_id)?
            .into_iter()
            .filter(|instance| instance.form_version == form.version);
        let mut removed = 0usize;
        for instance in owned {
            self.instances.delete(instance.id)?;
            removed += 1;
        }
        self.forms.delete(id)?;
        info!(
            form_id = %form.form_id,
            version = form.version.as_deref().unwrap_or("-"),
            instances = removed,
            "deleted form"
        );
        Ok(())
    }
}
