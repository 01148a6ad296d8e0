mod common;

use std::path::PathBuf;

use assert_matches::assert_matches;
use serde_json::json;

use cloudsat_data_manager::config::default_key_columns;
use cloudsat_data_manager::decoder::Decoder;
use cloudsat_data_manager::error::CsdmError;
use cloudsat_data_manager::filter::{FilterSpec, PlanSource, QueryEngine};
use cloudsat_data_manager::storage::{SwathStore, TABLE_2D, TABLE_3D};

use common::MockDecoder;

fn populated_store(dir: &std::path::Path) -> SwathStore {
    let path = dir.join("store.sqlite3");
    let files = [
        PathBuf::from("raw/2012034161842_30691_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf"),
        PathBuf::from("raw/2012034175735_30692_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf"),
    ];
    MockDecoder::default()
        .decode(&files, &[], &default_key_columns(), &path)
        .unwrap();
    SwathStore::new(&path)
}

#[test]
fn three_d_criteria_query_only_the_three_d_table() {
    let temp = tempfile::tempdir().unwrap();
    let store = populated_store(temp.path());
    let engine = QueryEngine::new(default_key_columns());
    let spec = FilterSpec::from_value(&json!({"Height": ["3d", ">=", 1200]})).unwrap();

    let plan = engine.plan(&spec, &["*".to_string()], None).unwrap();
    assert_eq!(plan.source, PlanSource::Table(TABLE_3D));
    assert!(plan.sql.contains("Height >= ?1"));
    assert!(!plan.sql.contains("1200"));

    let dataset = engine.filter(&store, &spec, &["*".to_string()]).unwrap();
    // Two granules, two footprints each, two of three heights pass.
    assert_eq!(dataset.len(), 8);
    let heights = dataset.numeric_column("Height").unwrap();
    assert!(heights.iter().all(|height| height.unwrap() >= 1200.0));
}

#[test]
fn mixed_criteria_join_on_geolocation() {
    let temp = tempfile::tempdir().unwrap();
    let store = populated_store(temp.path());
    let engine = QueryEngine::new(default_key_columns());
    let spec = FilterSpec::from_value(&json!({
        "Height": ["3d", "=", 1800],
        "SurfaceHeightBin": ["2d", "=", 61]
    }))
    .unwrap();
    let columns = vec![
        "Latitude".to_string(),
        "Height".to_string(),
        "SurfaceHeightBin".to_string(),
    ];
    let dataset = engine.filter(&store, &spec, &columns).unwrap();
    assert_eq!(dataset.columns, columns);
    assert_eq!(dataset.len(), 2);
}

#[test]
fn injection_attempts_stay_parameters() {
    let temp = tempfile::tempdir().unwrap();
    let store = populated_store(temp.path());
    let engine = QueryEngine::new(default_key_columns());
    let spec =
        FilterSpec::from_value(&json!({"Height": ["3d", ">", "0; DROP TABLE footprint_3d"]}))
            .unwrap();
    engine.filter(&store, &spec, &[]).unwrap();
    assert!(store.table_exists(TABLE_3D).unwrap());
}

#[test]
fn raw_query_runs_verbatim() {
    let temp = tempfile::tempdir().unwrap();
    let store = populated_store(temp.path());
    let engine = QueryEngine::new(default_key_columns());
    let spec = FilterSpec::from_value(&json!({
        "sql": "SELECT COUNT(*) AS n FROM footprint_2d"
    }))
    .unwrap();
    let dataset = engine.filter(&store, &spec, &[]).unwrap();
    assert_eq!(dataset.columns, vec!["n"]);
    assert_eq!(dataset.rows[0][0], json!(4));
}

#[test]
fn preview_is_bounded() {
    let temp = tempfile::tempdir().unwrap();
    let store = populated_store(temp.path());
    let engine = QueryEngine::new(default_key_columns());
    let spec = FilterSpec::from_value(&json!({"Height": ["3d", ">=", 0]})).unwrap();
    let dataset = engine.preview(&store, &spec, &[], 5).unwrap();
    assert_eq!(dataset.len(), 5);
}

#[test]
fn materialize_replaces_the_table() {
    let temp = tempfile::tempdir().unwrap();
    let store = populated_store(temp.path());
    let engine = QueryEngine::new(default_key_columns());
    let spec = FilterSpec::from_value(&json!({"SurfaceHeightBin": ["2d", "<", 61]})).unwrap();

    let kept = engine.materialize(&store, &spec, &["*".to_string()], None).unwrap();
    assert_eq!(kept, 2);
    assert_eq!(store.row_count(TABLE_2D).unwrap(), 2);
    assert_eq!(store.row_count(TABLE_3D).unwrap(), 12);

    assert_matches!(
        engine.materialize(&store, &spec, &[], Some("sqlite_master")),
        Err(CsdmError::InvalidFilter(_))
    );
}
