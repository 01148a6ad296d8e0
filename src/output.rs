use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::CsdmError;
use crate::fleet::FleetStatus;
use crate::job::{FailureReason, JobStatus};
use crate::progress::{ProgressRecord, Stage};
use crate::storage::Dataset;
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub progress: f64,
    pub to_do_list: Vec<String>,
    pub parsed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub job_id: String,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub materialized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub job_id: String,
    pub inbox_path: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResult {
    pub dir: String,
    pub files: usize,
}

/// Renders the parse record of a job, with its fleet classification when known.
pub fn job_status_view(workspace: &Workspace, job_id: &str) -> Result<JobStatusView, CsdmError> {
    let path = workspace.parse_record_path(job_id);
    if !path.exists() {
        return Err(CsdmError::JobNotFound(job_id.to_string()));
    }
    let record = ProgressRecord::load(path.as_std_path(), Stage::Parse)?;
    let fleet = FleetStatus::load(workspace.fleet_status_path().as_std_path())?;
    Ok(JobStatusView {
        job_id: job_id.to_string(),
        progress: record.progress(),
        to_do_list: record.to_do().to_vec(),
        parsed: record.done().to_vec(),
        status: fleet.status_of(job_id),
        failure_reason: fleet.failure_reasons.get(job_id).cloned(),
    })
}

/// The static reference geometry document, verbatim.
pub fn reference_dataset(path: Option<&Path>) -> Result<String, CsdmError> {
    let path = path.ok_or_else(|| {
        CsdmError::Filesystem("no reference_geometry configured".to_string())
    })?;
    fs::read_to_string(path)
        .map_err(|err| CsdmError::Filesystem(format!("{}: {err}", path.display())))
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_status(view: &JobStatusView) -> io::Result<()> {
        Self::print_json(view)
    }

    pub fn print_fleet(status: &FleetStatus) -> io::Result<()> {
        Self::print_json(status)
    }

    pub fn print_query(result: &QueryResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_submit(result: &SubmitResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_refresh(result: &RefreshResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_raw(content: &str) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(content.as_bytes())?;
        if !content.ends_with('\n') {
            stdout.write_all(b"\n")?;
        }
        Ok(())
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
