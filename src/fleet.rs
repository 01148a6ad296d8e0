//! Fleet-wide admission, supervision and intake.
//!
//! The manager is the single owner of every job handle and of the fleet status
//! document. All status transitions go through `FleetState` under one mutex and
//! are persisted before the lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use crate::config::AllocationPolicy;
use crate::archive::RemoteArchive;
use crate::config::ResolvedConfig;
use crate::decoder::Decoder;
use crate::error::CsdmError;
use crate::filter::FilterSpec;
use crate::fs_util;
use crate::job::{FailureReason, Job, JobOutcome, JobSpec, JobStatus};
use crate::request::JobRequest;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    #[serde(default)]
    pub not_ran: BTreeSet<String>,
    #[serde(default)]
    pub running: BTreeSet<String>,
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    #[serde(default)]
    pub failure_reasons: BTreeMap<String, FailureReason>,
}

impl FleetStatus {
    pub fn load(path: &Path) -> Result<Self, CsdmError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        fs_util::read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), CsdmError> {
        fs_util::write_json_atomic(path, self)
    }

    pub fn ids(&self, status: JobStatus) -> &BTreeSet<String> {
        match status {
            JobStatus::NotRan => &self.not_ran,
            JobStatus::Running => &self.running,
            JobStatus::Completed => &self.completed,
            JobStatus::Failed => &self.failed,
        }
    }

    fn ids_mut(&mut self, status: JobStatus) -> &mut BTreeSet<String> {
        match status {
            JobStatus::NotRan => &mut self.not_ran,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        }
    }

    pub fn status_of(&self, id: &str) -> Option<JobStatus> {
        [
            JobStatus::NotRan,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .into_iter()
        .find(|status| self.ids(*status).contains(id))
    }

    /// Moves `id` into exactly one set. A reason is kept only for failed jobs.
    pub fn set(&mut self, id: &str, status: JobStatus, reason: Option<FailureReason>) {
        for set in [
            &mut self.not_ran,
            &mut self.running,
            &mut self.completed,
            &mut self.failed,
        ] {
            set.remove(id);
        }
        self.ids_mut(status).insert(id.to_string());
        match (status, reason) {
            (JobStatus::Failed, Some(reason)) => {
                self.failure_reasons.insert(id.to_string(), reason);
            }
            (JobStatus::Failed, None) => {}
            _ => {
                self.failure_reasons.remove(id);
            }
        }
    }

    /// Errors unless `id` has completed, so nothing else can be writing its store.
    pub fn ensure_completed(&self, id: &str) -> Result<(), CsdmError> {
        match self.status_of(id) {
            Some(JobStatus::Completed) => Ok(()),
            Some(status) => Err(CsdmError::JobBusy {
                job_id: id.to_string(),
                status: status.to_string(),
            }),
            None => Err(CsdmError::JobNotFound(id.to_string())),
        }
    }

    pub fn is_consistent(&self) -> bool {
        let total = self.not_ran.len() + self.running.len() + self.completed.len() + self.failed.len();
        let union = self
            .not_ran
            .iter()
            .chain(&self.running)
            .chain(&self.completed)
            .chain(&self.failed)
            .collect::<BTreeSet<_>>();
        union.len() == total
    }
}

/// Debounced measurement of the shared throughput directory.
pub struct SpaceGauge {
    dir: PathBuf,
    ttl: Duration,
    cached: Mutex<Option<(Instant, u64)>>,
}

impl SpaceGauge {
    pub fn new(dir: PathBuf, ttl: Duration) -> Self {
        Self {
            dir,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn measure(&self) -> Result<u64, CsdmError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CsdmError::Filesystem("space gauge lock poisoned".to_string()))?;
        if let Some((at, bytes)) = *cached {
            if at.elapsed() < self.ttl {
                return Ok(bytes);
            }
        }
        let bytes = fs_util::dir_size(&self.dir)?;
        *cached = Some((Instant::now(), bytes));
        Ok(bytes)
    }

    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }
}

/// Request copy kept next to the progress records so a restart can rebuild the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmittedRequest {
    #[serde(flatten)]
    request: JobRequest,
    space_limit: u64,
}

struct JobEntry {
    job: Arc<Job>,
    handle: Option<JoinHandle<JobOutcome>>,
    attempts: u32,
}

struct FleetState {
    jobs: BTreeMap<String, JobEntry>,
    status: FleetStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisionReport {
    pub reaped: Vec<(String, JobStatus)>,
    pub started: Vec<String>,
    pub running: usize,
}

pub struct FleetManager<A: ?Sized, D: ?Sized> {
    config: ResolvedConfig,
    workspace: Workspace,
    archive: Arc<A>,
    decoder: Arc<D>,
    gauge: SpaceGauge,
    state: Mutex<FleetState>,
}

impl<A, D> FleetManager<A, D>
where
    A: RemoteArchive + ?Sized + 'static,
    D: Decoder + ?Sized + 'static,
{
    pub fn new(config: ResolvedConfig, archive: Arc<A>, decoder: Arc<D>) -> Result<Self, CsdmError> {
        let workspace = config.workspace();
        workspace.ensure_layout()?;
        let gauge = SpaceGauge::new(
            workspace.throughput_dir().into_std_path_buf(),
            config.space_cache,
        );
        Ok(Self {
            config,
            workspace,
            archive,
            decoder,
            gauge,
            state: Mutex::new(FleetState {
                jobs: BTreeMap::new(),
                status: FleetStatus::default(),
            }),
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn status(&self) -> Result<FleetStatus, CsdmError> {
        Ok(self.lock()?.status.clone())
    }

    pub fn job(&self, id: &str) -> Result<Option<Arc<Job>>, CsdmError> {
        Ok(self.lock()?.jobs.get(id).map(|entry| Arc::clone(&entry.job)))
    }

    /// Validates a request, reserves its space allocation and registers it as `not_ran`.
    pub fn admit(&self, request: JobRequest) -> Result<String, CsdmError> {
        let filter = request.validate()?;
        let id = request.job_id.trim().to_string();
        let mut state = self.lock()?;
        if state.status.status_of(&id).is_some() || state.jobs.contains_key(&id) {
            return Err(CsdmError::InvalidRequest(format!("duplicate jobId `{id}`")));
        }

        let space_limit = self.allocate(&state)?;
        let admitted = AdmittedRequest {
            request,
            space_limit,
        };
        fs_util::write_json_atomic(
            self.workspace.request_copy_path(&id).as_std_path(),
            &admitted,
        )?;
        let job = self.build_job(&admitted, filter)?;
        job.log().append(format!("admitted with {space_limit} bytes of space"))?;

        state.jobs.insert(
            id.clone(),
            JobEntry {
                job: Arc::new(job),
                handle: None,
                attempts: 0,
            },
        );
        state.status.set(&id, JobStatus::NotRan, None);
        self.persist(&state.status)?;
        tracing::info!(job_id = %id, space_limit, "job admitted");
        Ok(id)
    }

    fn build_job(
        &self,
        admitted: &AdmittedRequest,
        filter: FilterSpec,
    ) -> Result<Job, CsdmError> {
        let request = &admitted.request;
        let product = request
            .product_name
            .clone()
            .unwrap_or_else(|| self.config.default_product.clone());
        let fields = self.config.expand_fields(&product, &request.fields());
        let spec = JobSpec {
            id: request.job_id.trim().to_string(),
            product,
            range: request.date_range,
            fields,
            filter,
            space_limit: admitted.space_limit,
        };
        Ok(Job::new(
            spec,
            self.workspace.clone(),
            self.config.pipeline.clone(),
        ))
    }

    fn allocate(&self, state: &FleetState) -> Result<u64, CsdmError> {
        let minimum = self.config.min_job_space;
        match self.config.allocation_policy {
            AllocationPolicy::Fixed => Ok(minimum),
            AllocationPolicy::Proportional => {
                let remaining = self
                    .config
                    .global_space_limit
                    .saturating_sub(self.usage(state)?);
                Ok(minimum.max(remaining / 2))
            }
        }
    }

    /// Larger of the measured throughput size and the space reserved by running jobs.
    fn usage(&self, state: &FleetState) -> Result<u64, CsdmError> {
        let reserved = state
            .status
            .running
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|entry| entry.job.space_limit())
            .sum::<u64>();
        Ok(self.gauge.measure()?.max(reserved))
    }

    fn check_headroom(&self, state: &FleetState, needed: u64) -> Result<(), CsdmError> {
        let available = self
            .config
            .global_space_limit
            .saturating_sub(self.usage(state)?);
        if available < needed {
            return Err(CsdmError::QuotaExceeded { needed, available });
        }
        Ok(())
    }

    /// Reloads the fleet document and request copies after a restart.
    ///
    /// Jobs that were running when the process died are marked failed so the
    /// next supervision pass resumes them from their checkpoints.
    pub fn recover(&self) -> Result<usize, CsdmError> {
        let mut state = self.lock()?;
        let mut status = FleetStatus::load(self.workspace.fleet_status_path().as_std_path())?;
        let interrupted = status.running.iter().cloned().collect::<Vec<_>>();
        for id in &interrupted {
            status.set(
                id,
                JobStatus::Failed,
                Some(FailureReason::Crashed("interrupted".to_string())),
            );
        }

        let mut restored = 0;
        let pending = status
            .not_ran
            .iter()
            .chain(&status.failed)
            .cloned()
            .collect::<Vec<_>>();
        for id in pending {
            if state.jobs.contains_key(&id) {
                continue;
            }
            let path = self.workspace.request_copy_path(&id);
            let admitted = match fs_util::read_json::<AdmittedRequest>(path.as_std_path()) {
                Ok(admitted) => admitted,
                Err(err) => {
                    tracing::warn!(job_id = %id, error = %err, "cannot restore job");
                    continue;
                }
            };
            let job = match admitted
                .request
                .validate()
                .and_then(|filter| self.build_job(&admitted, filter))
            {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(job_id = %id, error = %err, "cannot restore job");
                    continue;
                }
            };
            let attempts = u32::from(status.failed.contains(&id));
            state.jobs.insert(
                id,
                JobEntry {
                    job: Arc::new(job),
                    handle: None,
                    attempts,
                },
            );
            restored += 1;
        }

        state.status = status;
        self.persist(&state.status)?;
        tracing::info!(restored, interrupted = interrupted.len(), "fleet recovered");
        Ok(restored)
    }

    /// One supervision pass: reap finished jobs, then start whatever fits the budget.
    pub fn supervise_once(&self) -> Result<SupervisionReport, CsdmError> {
        let mut state = self.lock()?;
        let mut report = SupervisionReport::default();

        let finished = state
            .jobs
            .iter()
            .filter(|(_, entry)| entry.handle.as_ref().is_some_and(JoinHandle::is_finished))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in finished {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            let outcome = match entry.handle.take().map(JoinHandle::join) {
                Some(Ok(outcome)) => Some(outcome),
                _ => None,
            };
            let progress = entry.job.parse_progress().unwrap_or(0.0);
            let (status, reason) = match outcome {
                Some(outcome) if progress == 1.0 && outcome.status == JobStatus::Completed => {
                    (JobStatus::Completed, None)
                }
                Some(outcome) => (
                    JobStatus::Failed,
                    Some(outcome.reason.unwrap_or(FailureReason::Incomplete)),
                ),
                None => (
                    JobStatus::Failed,
                    Some(FailureReason::Crashed("job thread panicked".to_string())),
                ),
            };
            tracing::info!(job_id = %id, %status, progress, "job finished");
            state.status.set(&id, status, reason);
            report.reaped.push((id, status));
        }
        if !report.reaped.is_empty() {
            self.gauge.invalidate();
        }

        let candidates = state
            .status
            .not_ran
            .iter()
            .chain(&state.status.failed)
            .cloned()
            .collect::<Vec<_>>();
        for id in candidates {
            if !self.startable(&state, &id) {
                continue;
            }
            let Some(space_limit) = state.jobs.get(&id).map(|entry| entry.job.space_limit()) else {
                continue;
            };
            if let Err(err) = self.check_headroom(&state, space_limit) {
                tracing::debug!(job_id = %id, error = %err, "waiting for headroom");
                continue;
            }
            let retry = state.status.failed.contains(&id);
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            let job = Arc::clone(&entry.job);
            let archive = Arc::clone(&self.archive);
            let decoder = Arc::clone(&self.decoder);
            let handle = thread::Builder::new()
                .name(format!("job-{id}"))
                .spawn(move || job.run(&*archive, &*decoder, retry))
                .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
            entry.handle = Some(handle);
            entry.attempts += 1;
            tracing::info!(job_id = %id, retry, attempt = entry.attempts, "job started");
            state.status.set(&id, JobStatus::Running, None);
            report.started.push(id);
        }

        report.running = state.status.running.len();
        self.persist(&state.status)?;
        Ok(report)
    }

    fn startable(&self, state: &FleetState, id: &str) -> bool {
        let Some(entry) = state.jobs.get(id) else {
            return false;
        };
        if entry.handle.is_some() {
            return false;
        }
        if state
            .status
            .failure_reasons
            .get(id)
            .is_some_and(|reason| !reason.is_retryable())
        {
            return false;
        }
        self.config
            .max_attempts
            .is_none_or(|max| entry.attempts < max)
    }

    /// Admits every request document in the inbox and files it under `processed`.
    pub fn intake_once(&self) -> Result<Vec<String>, CsdmError> {
        let inbox = self.workspace.inbox_dir().into_std_path_buf();
        let processed = self.workspace.processed_dir().into_std_path_buf();
        let mut admitted = Vec::new();
        for name in fs_util::list_file_names(&inbox)? {
            if !name.ends_with(".json") {
                continue;
            }
            let path = inbox.join(&name);
            match JobRequest::load(&path).and_then(|request| self.admit(request)) {
                Ok(id) => admitted.push(id),
                Err(err) => tracing::warn!(file = %name, error = %err, "request rejected"),
            }
            fs_util::move_into(&path, &processed)?;
        }
        Ok(admitted)
    }

    /// Supervises until nothing is running or startable, or `timeout` passes.
    pub fn settle(&self, poll: Duration, timeout: Duration) -> Result<FleetStatus, CsdmError> {
        let started = Instant::now();
        loop {
            let report = self.supervise_once()?;
            if report.running == 0 && report.started.is_empty() {
                return self.status();
            }
            if started.elapsed() >= timeout {
                return self.status();
            }
            thread::sleep(poll);
        }
    }

    /// Runs intake and supervision until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<(), CsdmError> {
        thread::scope(|scope| {
            scope.spawn(|| {
                while !shutdown.load(Ordering::SeqCst) {
                    if let Err(err) = self.intake_once() {
                        tracing::warn!(error = %err, "intake pass failed");
                    }
                    pause(self.config.intake_interval, shutdown);
                }
            });
            while !shutdown.load(Ordering::SeqCst) {
                if let Err(err) = self.supervise_once() {
                    tracing::warn!(error = %err, "supervision pass failed");
                }
                pause(self.config.supervise_interval, shutdown);
            }
        });
        Ok(())
    }

    fn persist(&self, status: &FleetStatus) -> Result<(), CsdmError> {
        status.save(self.workspace.fleet_status_path().as_std_path())
    }

    fn lock(&self) -> Result<MutexGuard<'_, FleetState>, CsdmError> {
        self.state
            .lock()
            .map_err(|_| CsdmError::Storage("fleet state lock poisoned".to_string()))
    }
}

fn pause(interval: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(200);
    let deadline = Instant::now() + interval;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(step.min(deadline - now));
    }
}
