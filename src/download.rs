use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::archive::RemoteArchive;
use crate::error::CsdmError;
use crate::fs_util;
use crate::progress::ProgressHandle;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bounded exponential backoff for a single transfer.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub retries: u32,
    pub base: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(MAX_BACKOFF)
    }

    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, CsdmError>) -> Result<T, CsdmError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retries => {
                    let delay = self.delay(attempt);
                    tracing::warn!(error = %err, attempt, ?delay, "transfer failed; backing off");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub advanced: usize,
    pub bytes: u64,
    pub exhausted: bool,
}

pub struct DownloadScheduler<'a, A: ?Sized> {
    archive: &'a A,
    record: &'a ProgressHandle,
    raw_dir: &'a Path,
    space_limit: u64,
    backoff: Backoff,
}

impl<'a, A: RemoteArchive + ?Sized> DownloadScheduler<'a, A> {
    pub fn new(
        archive: &'a A,
        record: &'a ProgressHandle,
        raw_dir: &'a Path,
        space_limit: u64,
        backoff: Backoff,
    ) -> Self {
        Self {
            archive,
            record,
            raw_dir,
            space_limit,
            backoff,
        }
    }

    /// Fetches files from the head of the to-do list until this call has
    /// transferred `space_limit` bytes or nothing is left.
    ///
    /// A file that still fails after backoff stays at the head and the error is
    /// returned; everything fetched before it is already checkpointed.
    pub fn run_batch(&self) -> Result<DownloadOutcome, CsdmError> {
        if self.record.snapshot()?.is_exhausted() {
            return Ok(DownloadOutcome {
                exhausted: true,
                ..DownloadOutcome::default()
            });
        }

        let baseline = fs_util::dir_size(self.raw_dir)?;
        if baseline != 0 {
            tracing::warn!(
                dir = %self.raw_dir.display(),
                bytes = baseline,
                "raw directory not empty before download batch"
            );
        }

        let mut outcome = DownloadOutcome::default();
        while outcome.bytes < self.space_limit {
            let Some(head) = self.record.snapshot()?.to_do().first().cloned() else {
                break;
            };
            let bytes = self
                .backoff
                .run(|| self.archive.fetch_file(&head, self.raw_dir))?;
            self.record.update(|record| record.mark_done(&head))?;
            tracing::debug!(file = %head, bytes, "downloaded");
            outcome.advanced += 1;
            outcome.bytes += bytes;
        }
        outcome.exhausted = self.record.snapshot()?.is_exhausted();
        Ok(outcome)
    }
}
