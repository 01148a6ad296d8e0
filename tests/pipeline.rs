mod common;

use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use cloudsat_data_manager::download::{Backoff, DownloadScheduler};
use cloudsat_data_manager::parse::ParseDispatcher;
use cloudsat_data_manager::progress::{ProgressHandle, ProgressRecord, Stage};
use cloudsat_data_manager::resolver::TargetResolver;
use cloudsat_data_manager::timeutil::{DateRange, path_date};

use common::{MockArchive, MockDecoder};

fn range() -> DateRange {
    "2012-02-03T00:00:00..2012-02-04T00:00:00".parse().unwrap()
}

fn backoff() -> Backoff {
    Backoff {
        retries: 0,
        base: Duration::from_millis(1),
    }
}

fn assert_invariants(record: &ProgressRecord, targets: &[String]) {
    assert!(record.is_consistent());
    let expected: BTreeSet<String> = targets.iter().cloned().collect();
    assert_eq!(record.target_set(), expected);
    let done = record.done().len() as f64;
    let total = (record.done().len() + record.to_do().len()) as f64;
    assert_eq!(record.progress(), done / total);
}

#[test]
fn resolved_targets_fall_inside_the_range() {
    let archive = MockArchive::new();
    let targets = TargetResolver::new(&archive)
        .resolve("2B-GEOPROF.P1_R05", &range())
        .unwrap();
    assert_eq!(targets.len(), 3);
    for target in &targets {
        let day = path_date(target).unwrap();
        assert!(range().contains_date(day), "{target} outside range");
        assert!((34..=35).contains(&chrono::Datelike::ordinal(&day)));
    }
}

#[test]
fn invariants_hold_after_every_batch() {
    let temp = tempfile::tempdir().unwrap();
    let raw = temp.path().join("raw");
    fs::create_dir_all(&raw).unwrap();
    let store = temp.path().join("store.sqlite3");
    let archive = MockArchive::new();
    let decoder = MockDecoder::default();

    let seeded = TargetResolver::new(&archive)
        .seed(
            "2B-GEOPROF.P1_R05",
            &range(),
            &temp.path().join("d.json"),
            &temp.path().join("p.json"),
        )
        .unwrap();
    let targets = seeded.download.snapshot().unwrap().to_do().to_vec();

    // One file per download batch, one file per parse batch.
    let scheduler = DownloadScheduler::new(&archive, &seeded.download, &raw, 1, backoff());
    let fields = vec!["Height".to_string()];
    let keys = cloudsat_data_manager::config::default_key_columns();
    let dispatcher = ParseDispatcher::new(
        &decoder,
        &seeded.download,
        &seeded.parse,
        &raw,
        &store,
        &fields,
        &keys,
        1,
    );

    loop {
        let downloaded = scheduler.run_batch().unwrap();
        assert_invariants(&seeded.download.snapshot().unwrap(), &targets);
        let parsed = dispatcher.run_batch().unwrap();
        assert_invariants(&seeded.parse.snapshot().unwrap(), &targets);
        assert_invariants(
            &ProgressRecord::load(&temp.path().join("p.json"), Stage::Parse).unwrap(),
            &targets,
        );
        if downloaded.exhausted && parsed.exhausted {
            break;
        }
    }

    let download = seeded.download.snapshot().unwrap();
    let parse = seeded.parse.snapshot().unwrap();
    assert_eq!(parse.progress(), 1.0);
    let mut downloaded = download.done().to_vec();
    let mut parsed = parse.done().to_vec();
    downloaded.sort();
    parsed.sort();
    assert_eq!(parsed, downloaded);
    assert!(fs::read_dir(&raw).unwrap().next().is_none());
}

#[test]
fn exhausted_download_is_a_noop() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("d.json");
    let mut record = ProgressRecord::seed(&["a"]);
    record.mark_done("a");
    let handle = ProgressHandle::create(&path, Stage::Download, record.clone()).unwrap();
    let before = fs::read_to_string(&path).unwrap();

    let archive = MockArchive::new();
    let scheduler = DownloadScheduler::new(&archive, &handle, temp.path(), 1_000, backoff());
    let outcome = scheduler.run_batch().unwrap();

    assert!(outcome.exhausted);
    assert_eq!(outcome.advanced, 0);
    assert_eq!(archive.fetch_count(), 0);
    assert_eq!(handle.version().unwrap(), 0);
    assert_eq!(handle.snapshot().unwrap(), record);
    assert_eq!(fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn decode_failure_keeps_batch_queued() {
    let temp = tempfile::tempdir().unwrap();
    let raw = temp.path().join("raw");
    fs::create_dir_all(&raw).unwrap();
    let archive = MockArchive::new();
    let seeded = TargetResolver::new(&archive)
        .seed(
            "2B-GEOPROF.P1_R05",
            &range(),
            &temp.path().join("d.json"),
            &temp.path().join("p.json"),
        )
        .unwrap();
    DownloadScheduler::new(&archive, &seeded.download, &raw, u64::MAX, backoff())
        .run_batch()
        .unwrap();

    let decoder = MockDecoder::failing();
    let store = temp.path().join("store.sqlite3");
    let dispatcher =
        ParseDispatcher::new(&decoder, &seeded.download, &seeded.parse, &raw, &store, &[], &[], 15);
    let before = seeded.parse.snapshot().unwrap();

    let outcome = dispatcher.run_batch().unwrap();
    assert!(outcome.skipped);
    assert_eq!(outcome.advanced, 0);
    let after = seeded.parse.snapshot().unwrap();
    assert_eq!(after.to_do(), before.to_do());
    assert_eq!(after.progress(), 0.0);
    assert_eq!(decoder.decoded_files().len(), 3);
    assert_eq!(fs::read_dir(&raw).unwrap().count(), 3);
}
