use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::archive::{RemoteArchive, remote_file_name};
use crate::config::PipelineSettings;
use crate::decoder::Decoder;
use crate::download::{Backoff, DownloadScheduler};
use crate::error::CsdmError;
use crate::filter::{FilterSpec, QueryEngine};
use crate::fs_util;
use crate::parse::ParseDispatcher;
use crate::preview::Preview;
use crate::progress::{ProgressHandle, ProgressRecord, Stage};
use crate::resolver::{SeededRecords, TargetResolver};
use crate::storage::{Dataset, SwathStore};
use crate::timeutil::DateRange;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotRan,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::NotRan => "not_ran",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    TimedOut,
    Crashed(String),
    ProductNotFound,
    DecodeFailures,
    Incomplete,
    Setup(String),
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::ProductNotFound)
    }

    fn from_setup_error(err: &CsdmError) -> Self {
        match err {
            CsdmError::ProductNotFound(_) => FailureReason::ProductNotFound,
            other => FailureReason::Setup(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TimedOut => write!(f, "timed out"),
            FailureReason::Crashed(message) => write!(f, "crashed: {message}"),
            FailureReason::ProductNotFound => write!(f, "product not found"),
            FailureReason::DecodeFailures => write!(f, "too many decode failures"),
            FailureReason::Incomplete => write!(f, "incomplete"),
            FailureReason::Setup(message) => write!(f, "setup failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub reason: Option<FailureReason>,
    pub downloaded: usize,
    pub parsed: usize,
}

impl JobOutcome {
    fn failed(reason: FailureReason) -> Self {
        Self {
            status: JobStatus::Failed,
            reason: Some(reason),
            downloaded: 0,
            parsed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub product: String,
    pub range: DateRange,
    pub fields: Vec<String>,
    pub filter: FilterSpec,
    pub space_limit: u64,
}

/// Human-readable append-only log of one job.
pub struct JobLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: impl fmt::Display) -> Result<(), CsdmError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CsdmError::Filesystem("job log lock poisoned".to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        writeln!(file, "{} {message}", chrono::Utc::now().to_rfc3339())
            .map_err(|err| CsdmError::Filesystem(err.to_string()))
    }

    fn line(&self, message: impl fmt::Display) {
        if let Err(err) = self.append(message) {
            tracing::warn!(path = %self.path.display(), error = %err, "job log write failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageEnd {
    Exhausted,
    TimedOut,
    Abandoned,
    Starved,
    DecodeFailures,
}

pub struct Job {
    spec: JobSpec,
    workspace: Workspace,
    pipeline: PipelineSettings,
    log: JobLog,
    thumb: Mutex<Option<Dataset>>,
}

impl Job {
    pub fn new(spec: JobSpec, workspace: Workspace, pipeline: PipelineSettings) -> Self {
        let log = JobLog::new(workspace.log_path(&spec.id).as_std_path());
        Self {
            spec,
            workspace,
            pipeline,
            log,
            thumb: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn space_limit(&self) -> u64 {
        self.spec.space_limit
    }

    pub fn log(&self) -> &JobLog {
        &self.log
    }

    pub fn working_dir(&self) -> PathBuf {
        self.workspace.working_dir(&self.spec.id).into_std_path_buf()
    }

    pub fn store(&self) -> SwathStore {
        SwathStore::new(self.workspace.storage_path(&self.spec.id).as_std_path())
    }

    /// Last preview dataset computed while parsing.
    pub fn thumb(&self) -> Option<Dataset> {
        self.thumb.lock().ok().and_then(|thumb| thumb.clone())
    }

    /// Parse progress as currently checkpointed on disk.
    pub fn parse_progress(&self) -> Result<f64, CsdmError> {
        let path = self.workspace.parse_record_path(&self.spec.id);
        Ok(ProgressRecord::load(path.as_std_path(), Stage::Parse)?.progress())
    }

    /// Runs both stages to completion or failure.
    ///
    /// A fresh run wipes the working directory and resolves the target set;
    /// a retry resumes from the checkpointed records.
    pub fn run<A, D>(&self, archive: &A, decoder: &D, retry: bool) -> JobOutcome
    where
        A: RemoteArchive + ?Sized,
        D: Decoder + ?Sized,
    {
        let _span = tracing::info_span!("job", job_id = %self.spec.id).entered();
        self.log.line(format!(
            "starting {} for {} over {} (retry: {retry})",
            self.spec.id, self.spec.product, self.spec.range
        ));

        let records = match self.prepare(archive, retry) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "job setup failed");
                self.log.line(format!("setup failed: {err}"));
                return JobOutcome::failed(FailureReason::from_setup_error(&err));
            }
        };

        let outcome = self.execute(archive, decoder, &records);
        match &outcome.reason {
            None => self.log.line(format!(
                "completed: {} downloaded, {} parsed",
                outcome.downloaded, outcome.parsed
            )),
            Some(reason) => self.log.line(format!("failed: {reason}")),
        }
        outcome
    }

    fn prepare<A: RemoteArchive + ?Sized>(
        &self,
        archive: &A,
        retry: bool,
    ) -> Result<SeededRecords, CsdmError> {
        let download_path = self.workspace.download_record_path(&self.spec.id);
        let parse_path = self.workspace.parse_record_path(&self.spec.id);
        let raw_dir = self.workspace.raw_dir(&self.spec.id);

        if retry && download_path.exists() && parse_path.exists() {
            fs::create_dir_all(raw_dir.as_std_path())
                .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
            sweep_partials(raw_dir.as_std_path())?;
            let records = SeededRecords {
                download: ProgressHandle::open(download_path.as_std_path(), Stage::Download)?,
                parse: ProgressHandle::open(parse_path.as_std_path(), Stage::Parse)?,
            };
            let requeued = requeue_missing(&records, raw_dir.as_std_path())?;
            if requeued > 0 {
                tracing::warn!(requeued, "downloaded files missing locally; fetching again");
            }
            self.log.line(format!(
                "resuming from checkpointed progress ({requeued} files requeued for download)"
            ));
            return Ok(records);
        }
        if retry {
            tracing::warn!("no checkpoint to resume; resolving afresh");
        }

        fs_util::reset_dir(self.working_dir().as_path())?;
        fs::create_dir_all(raw_dir.as_std_path())
            .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        let records = TargetResolver::new(archive).seed(
            &self.spec.product,
            &self.spec.range,
            download_path.as_std_path(),
            parse_path.as_std_path(),
        )?;
        self.log.line(format!(
            "resolved {} target files",
            records.download.snapshot()?.total()
        ));
        Ok(records)
    }

    fn execute<A, D>(&self, archive: &A, decoder: &D, records: &SeededRecords) -> JobOutcome
    where
        A: RemoteArchive + ?Sized,
        D: Decoder + ?Sized,
    {
        let raw_dir = self.workspace.raw_dir(&self.spec.id).into_std_path_buf();
        let store_path = self.workspace.storage_path(&self.spec.id).into_std_path_buf();
        let scheduler = DownloadScheduler::new(
            archive,
            &records.download,
            &raw_dir,
            self.spec.space_limit,
            Backoff {
                retries: self.pipeline.transfer_retries,
                base: self.pipeline.transfer_backoff,
            },
        );
        let dispatcher = ParseDispatcher::new(
            decoder,
            &records.download,
            &records.parse,
            &raw_dir,
            &store_path,
            &self.spec.fields,
            &self.pipeline.key_columns,
            self.pipeline.parse_batch_size,
        );
        let download_done = AtomicBool::new(false);
        let processing_done = AtomicBool::new(false);

        let (download_end, processing_end) = thread::scope(|scope| {
            let download = scope.spawn(|| {
                let end = self.download_loop(&scheduler, &dispatcher, records, &processing_done);
                download_done.store(true, Ordering::SeqCst);
                records.download.notify();
                end
            });
            let processing = scope.spawn(|| {
                let end = self.processing_loop(&dispatcher, records, &download_done);
                processing_done.store(true, Ordering::SeqCst);
                records.parse.notify();
                end
            });
            (join_stage(download), join_stage(processing))
        });

        self.classify(records, download_end, processing_end)
    }

    fn download_loop<A, D>(
        &self,
        scheduler: &DownloadScheduler<'_, A>,
        dispatcher: &ParseDispatcher<'_, D>,
        records: &SeededRecords,
        processing_done: &AtomicBool,
    ) -> Result<StageEnd, CsdmError>
    where
        A: RemoteArchive + ?Sized,
        D: Decoder + ?Sized,
    {
        let started = Instant::now();
        let mut parse_seen = records.parse.version()?;
        loop {
            if started.elapsed() >= self.pipeline.download_timeout {
                tracing::warn!(stage = %Stage::Download, "stage timed out");
                return Ok(StageEnd::TimedOut);
            }
            if processing_done.load(Ordering::SeqCst) {
                return Ok(StageEnd::Abandoned);
            }
            if !dispatcher.ready()?.is_empty() {
                parse_seen = records
                    .parse
                    .wait_for_change(parse_seen, self.pipeline.idle_poll)?;
                continue;
            }
            match scheduler.run_batch() {
                Ok(outcome) if outcome.exhausted => return Ok(StageEnd::Exhausted),
                Ok(outcome) => {
                    tracing::info!(
                        stage = %Stage::Download,
                        files = outcome.advanced,
                        bytes = outcome.bytes,
                        "download batch finished"
                    );
                }
                Err(CsdmError::TransferFailure { path, message }) => {
                    tracing::warn!(stage = %Stage::Download, file = %path, %message, "transfer failed");
                    self.log.line(format!("transfer of {path} failed: {message}"));
                    thread::sleep(self.pipeline.idle_poll);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn processing_loop<D: Decoder + ?Sized>(
        &self,
        dispatcher: &ParseDispatcher<'_, D>,
        records: &SeededRecords,
        download_done: &AtomicBool,
    ) -> Result<StageEnd, CsdmError> {
        let started = Instant::now();
        let mut failures = 0u32;
        let mut download_seen = records.download.version()?;
        loop {
            if self
                .pipeline
                .parse_timeout
                .is_some_and(|timeout| started.elapsed() >= timeout)
            {
                tracing::warn!(stage = %Stage::Parse, "stage timed out");
                return Ok(StageEnd::TimedOut);
            }

            let outcome = dispatcher.run_batch()?;
            if outcome.exhausted {
                return Ok(StageEnd::Exhausted);
            }
            if outcome.advanced > 0 {
                failures = 0;
                self.refresh_thumb();
                continue;
            }
            if outcome.skipped {
                failures += 1;
                self.log.line(format!("decode failed ({failures} in a row)"));
                if failures >= self.pipeline.max_decode_failures {
                    return Ok(StageEnd::DecodeFailures);
                }
                thread::sleep(self.pipeline.idle_poll);
                continue;
            }

            if download_done.load(Ordering::SeqCst) && dispatcher.ready()?.is_empty() {
                return Ok(StageEnd::Starved);
            }
            download_seen = records
                .download
                .wait_for_change(download_seen, self.pipeline.idle_poll)?;
        }
    }

    fn classify(
        &self,
        records: &SeededRecords,
        download_end: Result<StageEnd, CsdmError>,
        processing_end: Result<StageEnd, CsdmError>,
    ) -> JobOutcome {
        let (download, parse) = match (records.download.snapshot(), records.parse.snapshot()) {
            (Ok(download), Ok(parse)) => (download, parse),
            (Err(err), _) | (_, Err(err)) => {
                return JobOutcome::failed(FailureReason::Crashed(err.to_string()));
            }
        };
        let mut outcome = JobOutcome {
            status: JobStatus::Failed,
            reason: None,
            downloaded: download.done().len(),
            parsed: parse.done().len(),
        };

        if download.is_exhausted() && parse.is_exhausted() && parse.progress() == 1.0 {
            outcome.status = JobStatus::Completed;
            let artifact = panic::catch_unwind(AssertUnwindSafe(|| {
                self.refresh_thumb();
                self.write_preview();
            }));
            if artifact.is_err() {
                tracing::warn!("preview artifact panicked; job status unchanged");
                self.log.line("preview artifact failed");
            }
            return outcome;
        }

        outcome.reason = Some(match (download_end, processing_end) {
            (_, Ok(StageEnd::DecodeFailures)) => FailureReason::DecodeFailures,
            (Err(err), _) | (_, Err(err)) => FailureReason::Crashed(err.to_string()),
            (Ok(StageEnd::TimedOut), _) | (_, Ok(StageEnd::TimedOut)) => FailureReason::TimedOut,
            _ => FailureReason::Incomplete,
        });
        outcome
    }

    fn refresh_thumb(&self) {
        let store = self.store();
        if !store.exists() {
            return;
        }
        let engine = QueryEngine::new(self.pipeline.key_columns.clone());
        let columns = preview_columns(&self.spec.fields, &self.pipeline.key_columns);
        match engine.preview(&store, &self.spec.filter, &columns, self.pipeline.preview_rows) {
            Ok(dataset) => {
                if let Ok(mut thumb) = self.thumb.lock() {
                    *thumb = Some(dataset);
                }
            }
            Err(err) => tracing::debug!(error = %err, "preview query not ready"),
        }
    }

    fn write_preview(&self) {
        let Some(dataset) = self.thumb() else {
            return;
        };
        let Some(preview) =
            Preview::from_dataset(&dataset, &self.spec.fields, &self.pipeline.key_columns)
        else {
            tracing::info!("preview lacks geolocation columns; skipping artifact");
            return;
        };
        let path = self.workspace.preview_path(&self.spec.id);
        match preview.write(path.as_std_path()) {
            Ok(()) => self.log.line(format!("preview written to {path}")),
            Err(err) => {
                tracing::warn!(error = %err, "preview artifact failed");
                self.log.line(format!("preview artifact failed: {err}"));
            }
        }
    }
}

fn join_stage(
    handle: thread::ScopedJoinHandle<'_, Result<StageEnd, CsdmError>>,
) -> Result<StageEnd, CsdmError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(CsdmError::Storage("stage thread panicked".to_string())))
}

/// Key columns first, then the requested fields; `*` selects everything.
fn preview_columns(fields: &[String], key_columns: &[String]) -> Vec<String> {
    if fields.iter().any(|field| field == "*") {
        return vec!["*".to_string()];
    }
    let mut columns = key_columns.to_vec();
    for field in fields {
        if !columns.iter().any(|column| column.eq_ignore_ascii_case(field)) {
            columns.push(field.clone());
        }
    }
    columns
}

/// Sends entries that are downloaded but neither parsed nor present in `raw_dir`
/// back to the download queue.
fn requeue_missing(records: &SeededRecords, raw_dir: &Path) -> Result<usize, CsdmError> {
    let local = fs_util::list_file_names(raw_dir)?
        .into_iter()
        .collect::<BTreeSet<_>>();
    let pending = records.parse.snapshot()?;
    records.download.update(|download| {
        let missing = pending
            .to_do()
            .iter()
            .filter(|entry| download.is_done(entry))
            .filter(|entry| !local.contains(remote_file_name(entry)))
            .cloned()
            .collect::<Vec<_>>();
        missing
            .iter()
            .filter(|entry| download.requeue(entry))
            .count()
    })
}

/// Drops half-written transfers left behind by an interrupted run.
fn sweep_partials(raw_dir: &Path) -> Result<(), CsdmError> {
    for name in fs_util::list_file_names(raw_dir)? {
        if name.ends_with(".part") {
            fs::remove_file(raw_dir.join(&name))
                .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}
