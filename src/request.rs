use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CsdmError;
use crate::filter::FilterSpec;
use crate::fs_util;
use crate::timeutil::DateRange;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    Query,
    Other(String),
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        if value == "Query" {
            JobType::Query
        } else {
            JobType::Other(value)
        }
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Query => write!(f, "Query"),
            JobType::Other(other) => write!(f, "{other}"),
        }
    }
}

/// A request document as dropped into the intake inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub job_id: String,
    pub job_type: JobType,
    pub date_range: DateRange,
    #[serde(default)]
    pub filter_criteria: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_names: Option<Vec<String>>,
}

impl JobRequest {
    pub fn from_json(content: &str) -> Result<Self, CsdmError> {
        serde_json::from_str(content).map_err(|err| CsdmError::InvalidRequest(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, CsdmError> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| CsdmError::Filesystem(format!("{}: {err}", path.display())))?;
        Self::from_json(&content)
    }

    /// Checks everything admission relies on and returns the parsed filter.
    pub fn validate(&self) -> Result<FilterSpec, CsdmError> {
        if let JobType::Other(kind) = &self.job_type {
            return Err(CsdmError::UnsupportedJobType(kind.clone()));
        }
        let id = self.job_id.trim();
        if id.is_empty() {
            return Err(CsdmError::InvalidRequest("jobId must not be empty".to_string()));
        }
        if !id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
            || id.starts_with('.')
        {
            return Err(CsdmError::InvalidRequest(format!(
                "jobId `{id}` may only contain letters, digits, `-`, `_` and `.`"
            )));
        }
        FilterSpec::from_value(&self.filter_criteria)
    }

    /// Validates the document at `source` and drops a copy into `inbox` for intake.
    pub fn submit(source: &Path, inbox: &Path) -> Result<(Self, PathBuf), CsdmError> {
        let request = Self::load(source)?;
        request.validate()?;
        let target = inbox.join(format!("{}.json", request.job_id.trim()));
        fs_util::write_json_atomic(&target, &request)?;
        Ok((request, target))
    }

    pub fn fields(&self) -> Vec<String> {
        self.field_names
            .clone()
            .filter(|fields| !fields.is_empty())
            .unwrap_or_else(|| vec!["*".to_string()])
    }
}
