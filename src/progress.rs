//! Durable per-stage checkpoints.
//!
//! Each pipeline stage owns one record: the identifiers it still has to process
//! (`to_do_list`) and those it has finished (`downloaded_files` or `parsed` on
//! disk). The union of both lists is the target set fixed at resolution time;
//! updates only migrate identifiers between the two lists.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsdmError;
use crate::fs_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Parse,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => write!(f, "download"),
            Stage::Parse => write!(f, "parse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    progress: f64,
    to_do_list: Vec<String>,
    done_list: Vec<String>,
}

impl ProgressRecord {
    pub fn seed<S: AsRef<str>>(targets: &[S]) -> Self {
        let mut seen = BTreeSet::new();
        let to_do_list = targets
            .iter()
            .map(|target| target.as_ref().to_string())
            .filter(|target| seen.insert(target.clone()))
            .collect();
        let mut record = Self {
            progress: 0.0,
            to_do_list,
            done_list: Vec::new(),
        };
        record.recompute();
        record
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn to_do(&self) -> &[String] {
        &self.to_do_list
    }

    pub fn done(&self) -> &[String] {
        &self.done_list
    }

    pub fn total(&self) -> usize {
        self.to_do_list.len() + self.done_list.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.to_do_list.is_empty()
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.done_list.iter().any(|item| item == id)
    }

    pub fn target_set(&self) -> BTreeSet<String> {
        self.to_do_list
            .iter()
            .chain(self.done_list.iter())
            .cloned()
            .collect()
    }

    /// Moves `id` from the to-do list to the done list. Unknown ids are ignored.
    pub fn mark_done(&mut self, id: &str) -> bool {
        let Some(index) = self.to_do_list.iter().position(|item| item == id) else {
            return false;
        };
        let item = self.to_do_list.remove(index);
        self.done_list.push(item);
        self.recompute();
        true
    }

    /// Moves `id` back from the done list to the head of the to-do list.
    pub fn requeue(&mut self, id: &str) -> bool {
        let Some(index) = self.done_list.iter().position(|item| item == id) else {
            return false;
        };
        let item = self.done_list.remove(index);
        self.to_do_list.insert(0, item);
        self.recompute();
        true
    }

    /// An empty target set counts as fully processed.
    pub fn recompute(&mut self) {
        let total = self.total();
        self.progress = if total == 0 {
            1.0
        } else {
            self.done_list.len() as f64 / total as f64
        };
    }

    pub fn is_consistent(&self) -> bool {
        let to_do = self.to_do_list.iter().collect::<BTreeSet<_>>();
        let done = self.done_list.iter().collect::<BTreeSet<_>>();
        let disjoint = to_do.is_disjoint(&done);
        let unique = to_do.len() == self.to_do_list.len() && done.len() == self.done_list.len();
        let mut expected = self.clone();
        expected.recompute();
        disjoint && unique && expected.progress == self.progress
    }

    pub fn load(path: &Path, stage: Stage) -> Result<Self, CsdmError> {
        let record = match stage {
            Stage::Download => fs_util::read_json::<DownloadDocument>(path)?.into(),
            Stage::Parse => fs_util::read_json::<ParseDocument>(path)?.into(),
        };
        Ok(record)
    }

    pub fn save(&self, path: &Path, stage: Stage) -> Result<(), CsdmError> {
        match stage {
            Stage::Download => fs_util::write_json_atomic(path, &DownloadDocument::from(self)),
            Stage::Parse => fs_util::write_json_atomic(path, &ParseDocument::from(self)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DownloadDocument {
    progress: f64,
    to_do_list: Vec<String>,
    downloaded_files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ParseDocument {
    progress: f64,
    to_do_list: Vec<String>,
    parsed: Vec<String>,
}

impl From<DownloadDocument> for ProgressRecord {
    fn from(value: DownloadDocument) -> Self {
        Self {
            progress: value.progress,
            to_do_list: value.to_do_list,
            done_list: value.downloaded_files,
        }
    }
}

impl From<ParseDocument> for ProgressRecord {
    fn from(value: ParseDocument) -> Self {
        Self {
            progress: value.progress,
            to_do_list: value.to_do_list,
            done_list: value.parsed,
        }
    }
}

impl From<&ProgressRecord> for DownloadDocument {
    fn from(value: &ProgressRecord) -> Self {
        Self {
            progress: value.progress,
            to_do_list: value.to_do_list.clone(),
            downloaded_files: value.done_list.clone(),
        }
    }
}

impl From<&ProgressRecord> for ParseDocument {
    fn from(value: &ProgressRecord) -> Self {
        Self {
            progress: value.progress,
            to_do_list: value.to_do_list.clone(),
            parsed: value.done_list.clone(),
        }
    }
}

struct Mirror {
    version: u64,
    record: ProgressRecord,
}

/// In-memory mirror of one stage's record with a single serialized write path.
///
/// Every update is persisted before it becomes visible, so readers never see
/// state that a crash could lose. Waiters are woken on each committed update.
pub struct ProgressHandle {
    stage: Stage,
    path: PathBuf,
    mirror: Mutex<Mirror>,
    changed: Condvar,
}

impl ProgressHandle {
    pub fn create(path: &Path, stage: Stage, record: ProgressRecord) -> Result<Self, CsdmError> {
        record.save(path, stage)?;
        Ok(Self::wrap(path, stage, record))
    }

    pub fn open(path: &Path, stage: Stage) -> Result<Self, CsdmError> {
        let record = ProgressRecord::load(path, stage)?;
        Ok(Self::wrap(path, stage, record))
    }

    fn wrap(path: &Path, stage: Stage, record: ProgressRecord) -> Self {
        Self {
            stage,
            path: path.to_path_buf(),
            mirror: Mutex::new(Mirror { version: 0, record }),
            changed: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> Result<ProgressRecord, CsdmError> {
        Ok(self.lock()?.record.clone())
    }

    pub fn version(&self) -> Result<u64, CsdmError> {
        Ok(self.lock()?.version)
    }

    /// Applies `change` to a copy, persists it, then publishes it.
    pub fn update<R>(&self, change: impl FnOnce(&mut ProgressRecord) -> R) -> Result<R, CsdmError> {
        let mut mirror = self.lock()?;
        let mut next = mirror.record.clone();
        let result = change(&mut next);
        next.recompute();
        if next != mirror.record {
            next.save(&self.path, self.stage)?;
            mirror.record = next;
            mirror.version += 1;
            self.changed.notify_all();
        }
        Ok(result)
    }

    /// Blocks until the version moves past `seen` or `timeout` elapses.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64, CsdmError> {
        let mirror = self.lock()?;
        let (mirror, _) = self
            .changed
            .wait_timeout_while(mirror, timeout, |mirror| mirror.version == seen)
            .map_err(|_| CsdmError::Storage(format!("{} progress lock poisoned", self.stage)))?;
        Ok(mirror.version)
    }

    /// Wakes waiters without changing the record, e.g. when a peer stage stops.
    ///
    /// The version still moves so `wait_for_change` returns at once.
    pub fn notify(&self) {
        if let Ok(mut mirror) = self.mirror.lock() {
            mirror.version += 1;
        }
        self.changed.notify_all();
    }

    fn lock(&self) -> Result<MutexGuard<'_, Mirror>, CsdmError> {
        self.mirror
            .lock()
            .map_err(|_| CsdmError::Storage(format!("{} progress lock poisoned", self.stage)))
    }
}
