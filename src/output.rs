use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FormListResult, InstanceListResult, SyncResult};
use crate::domain::Instance;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::submit::SubmissionResult;
use crate::task::UploadTaskOutcome;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(result: &SyncResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_forms(result: &FormListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_instances(result: &InstanceListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_instance(instance: &Instance) -> io::Result<()> {
        Self::print_json(instance)
    }

    pub fn print_submission(result: &SubmissionResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_upload(outcome: &UploadTaskOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Progress lines on stderr, keeping stdout for the JSON result.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("{}", event.message),
        }
    }
}
