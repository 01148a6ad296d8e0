use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::remote_file_name;
use crate::decoder::Decoder;
use crate::error::CsdmError;
use crate::fs_util;
use crate::progress::ProgressHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    pub advanced: usize,
    pub exhausted: bool,
    /// The decoder rejected the batch; its files stay queued for another pass.
    pub skipped: bool,
}

pub struct ParseDispatcher<'a, D: ?Sized> {
    decoder: &'a D,
    download: &'a ProgressHandle,
    parse: &'a ProgressHandle,
    raw_dir: &'a Path,
    store_path: &'a Path,
    field_names: &'a [String],
    key_columns: &'a [String],
    batch_size: usize,
}

impl<'a, D: Decoder + ?Sized> ParseDispatcher<'a, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        decoder: &'a D,
        download: &'a ProgressHandle,
        parse: &'a ProgressHandle,
        raw_dir: &'a Path,
        store_path: &'a Path,
        field_names: &'a [String],
        key_columns: &'a [String],
        batch_size: usize,
    ) -> Self {
        Self {
            decoder,
            download,
            parse,
            raw_dir,
            store_path,
            field_names,
            key_columns,
            batch_size,
        }
    }

    /// Local file names that are downloaded, still queued for parsing, and on disk.
    pub fn ready(&self) -> Result<Vec<String>, CsdmError> {
        let local = fs_util::list_file_names(self.raw_dir)?
            .into_iter()
            .collect::<BTreeSet<_>>();
        let downloaded = self.download.snapshot()?;
        let queued = self.parse.snapshot()?;
        Ok(queued
            .to_do()
            .iter()
            .filter(|entry| downloaded.is_done(entry))
            .map(|entry| remote_file_name(entry).to_string())
            .filter(|name| local.contains(name))
            .take(self.batch_size)
            .collect())
    }

    pub fn run_batch(&self) -> Result<ParseOutcome, CsdmError> {
        if self.parse.snapshot()?.is_exhausted() {
            return Ok(ParseOutcome {
                exhausted: true,
                ..ParseOutcome::default()
            });
        }

        let batch = self.ready()?;
        if batch.is_empty() {
            return Ok(ParseOutcome::default());
        }

        let files = batch
            .iter()
            .map(|name| self.raw_dir.join(name))
            .collect::<Vec<PathBuf>>();
        if let Err(err) =
            self.decoder
                .decode(&files, self.field_names, self.key_columns, self.store_path)
        {
            tracing::warn!(error = %err, files = files.len(), "decode failed; batch left for retry");
            return Ok(ParseOutcome {
                skipped: true,
                ..ParseOutcome::default()
            });
        }

        let advanced = self.parse.update(|record| {
            let consumed = record
                .to_do()
                .iter()
                .filter(|entry| batch.iter().any(|name| remote_file_name(entry) == name))
                .cloned()
                .collect::<Vec<_>>();
            consumed
                .iter()
                .filter(|entry| record.mark_done(entry))
                .count()
        })?;

        // Checkpointed first: a crash here leaks a raw file, never a parsed entry.
        for file in &files {
            if let Err(err) = fs::remove_file(file) {
                tracing::warn!(file = %file.display(), error = %err, "could not remove parsed file");
            }
        }
        tracing::debug!(advanced, "parsed batch");

        Ok(ParseOutcome {
            advanced,
            exhausted: self.parse.snapshot()?.is_exhausted(),
            skipped: false,
        })
    }
}
