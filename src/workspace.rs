use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::error::CsdmError;

pub const FLEET_STATUS_FILE: &str = "fleet_status.json";

/// On-disk layout shared by the fleet manager and every job.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: Utf8PathBuf,
}

impl Workspace {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, CsdmError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("cloudsat-data-manager"))
                    .ok()
            })
            .ok_or_else(|| CsdmError::Filesystem("unable to resolve data directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Shared throughput directory; its measured size is the global disk usage.
    pub fn throughput_dir(&self) -> Utf8PathBuf {
        self.root.join("throughput")
    }

    pub fn working_dir(&self, job_id: &str) -> Utf8PathBuf {
        self.throughput_dir().join(job_id)
    }

    pub fn raw_dir(&self, job_id: &str) -> Utf8PathBuf {
        self.working_dir(job_id).join("raw")
    }

    pub fn storage_path(&self, job_id: &str) -> Utf8PathBuf {
        self.working_dir(job_id).join("store.sqlite3")
    }

    pub fn jobs_info_dir(&self) -> Utf8PathBuf {
        self.root.join("jobsInfo")
    }

    pub fn download_record_path(&self, job_id: &str) -> Utf8PathBuf {
        self.jobs_info_dir()
            .join(format!("{job_id}_download_task.json"))
    }

    pub fn parse_record_path(&self, job_id: &str) -> Utf8PathBuf {
        self.jobs_info_dir()
            .join(format!("{job_id}_parsing_task.json"))
    }

    pub fn request_copy_path(&self, job_id: &str) -> Utf8PathBuf {
        self.jobs_info_dir().join(format!("{job_id}_request.json"))
    }

    pub fn preview_path(&self, job_id: &str) -> Utf8PathBuf {
        self.jobs_info_dir().join(format!("{job_id}_preview.json"))
    }

    pub fn fleet_status_path(&self) -> Utf8PathBuf {
        self.jobs_info_dir().join(FLEET_STATUS_FILE)
    }

    pub fn inbox_dir(&self) -> Utf8PathBuf {
        self.root.join("requests")
    }

    pub fn processed_dir(&self) -> Utf8PathBuf {
        self.inbox_dir().join("processed")
    }

    pub fn log_path(&self, job_id: &str) -> Utf8PathBuf {
        self.root.join("logs").join(format!("{job_id}.log"))
    }

    pub fn listing_cache_path(&self) -> Utf8PathBuf {
        self.root.join("listing_cache.json")
    }

    pub fn ensure_layout(&self) -> Result<(), CsdmError> {
        for dir in [
            self.throughput_dir(),
            self.jobs_info_dir(),
            self.inbox_dir(),
            self.processed_dir(),
            self.root.join("logs"),
        ] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let workspace = Workspace::new(Utf8PathBuf::from("/srv/csdm"));
        assert_eq!(
            workspace.parse_record_path("0002"),
            Utf8PathBuf::from("/srv/csdm/jobsInfo/0002_parsing_task.json")
        );
        assert!(workspace.raw_dir("0002").ends_with("throughput/0002/raw"));
        assert!(
            workspace
                .storage_path("0002")
                .starts_with(workspace.working_dir("0002"))
        );
        assert!(!workspace.log_path("0002").starts_with(workspace.working_dir("0002")));
    }
}
