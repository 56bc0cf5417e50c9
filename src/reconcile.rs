use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::downloader::FormDownloader;
use crate::error::SyncError;
use crate::form_source::FormSource;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::repository::{FormDeleter, FormsRepository, InstancesRepository};

/// Makes the local form catalog match the server's form list exactly.
pub struct CatalogReconciler<S: FormSource, D: FormDownloader> {
    source: S,
    downloader: D,
    forms: Arc<dyn FormsRepository>,
    instances: Arc<dyn InstancesRepository>,
}

impl<S: FormSource, D: FormDownloader> CatalogReconciler<S, D> {
    pub fn new(
        source: S,
        downloader: D,
        forms: Arc<dyn FormsRepository>,
        instances: Arc<dyn InstancesRepository>,
    ) -> Self {
        Self {
            source,
            downloader,
            forms,
            instances,
        }
    }

    pub fn synchronize(
        &self,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let remote = self.source.fetch_form_details()?;
        let local = self.forms.get_all()?;

        let remote_ids = remote
            .iter()
            .map(|form| form.form_id.as_str())
            .collect::<HashSet<_>>();
        let deleter = FormDeleter::new(self.forms.as_ref(), self.instances.as_ref());
        for form in local
            .iter()
            .filter(|form| !remote_ids.contains(form.form_id.as_str()))
        {
            progress.event(ProgressEvent::new(format!(
                "phase=Delete; form {}",
                form.form_id
            )));
            deleter.delete(form.id)?;
        }

        let mut failed = 0usize;
        for descriptor in remote.iter().filter(|form| form.needs_download()) {
            match self.downloader.download_form(descriptor, progress, cancel) {
                Ok(()) => {}
                Err(SyncError::Interrupted) => {
                    info!(form_id = %descriptor.form_id, "synchronization interrupted");
                    return Ok(());
                }
                Err(err) => {
                    warn!(form_id = %descriptor.form_id, error = %err, "form download failed");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(SyncError::FetchError(
                "synchronization had failures".to_string(),
            ));
        }
        Ok(())
    }
}
