#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use rusqlite::{Connection, params};

use cloudsat_data_manager::archive::{RemoteArchive, remote_file_name};
use cloudsat_data_manager::config::{Config, ConfigLoader, ResolvedConfig};
use cloudsat_data_manager::decoder::Decoder;
use cloudsat_data_manager::error::CsdmError;

pub const PRODUCT_DIR: &str = "/Data/2B-GEOPROF.P1_R05";

pub fn granules() -> Vec<String> {
    [
        "2012/033/2012033223014_30676_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf",
        "2012/034/2012034161842_30691_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf",
        "2012/034/2012034175735_30692_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf",
        "2012/035/2012035003207_30696_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf",
        "2012/036/2012036092431_30712_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf",
    ]
    .into_iter()
    .map(|path| format!("{PRODUCT_DIR}/{path}"))
    .collect()
}

pub struct MockArchive {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
    pub size: u64,
    pub fetched: Mutex<Vec<String>>,
    /// Fetches beyond this many fail as transfer errors.
    pub fetch_limit: Mutex<Option<usize>>,
}

impl MockArchive {
    pub fn new() -> Self {
        Self {
            dirs: vec![PRODUCT_DIR.to_string()],
            files: granules(),
            size: 64,
            fetched: Mutex::new(Vec::new()),
            fetch_limit: Mutex::new(None),
        }
    }

    pub fn empty() -> Self {
        Self {
            dirs: Vec::new(),
            files: Vec::new(),
            size: 0,
            fetched: Mutex::new(Vec::new()),
            fetch_limit: Mutex::new(None),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }

    pub fn limit_fetches(&self, limit: Option<usize>) {
        *self.fetch_limit.lock().unwrap() = limit;
    }
}

impl RemoteArchive for MockArchive {
    fn search_sub_dir(&self, name: &str) -> Result<Vec<String>, CsdmError> {
        Ok(self
            .dirs
            .iter()
            .filter(|dir| dir.contains(name))
            .cloned()
            .collect())
    }

    fn file_list(&self, dir: &str) -> Result<Vec<String>, CsdmError> {
        Ok(self
            .files
            .iter()
            .filter(|file| file.starts_with(dir))
            .cloned()
            .collect())
    }

    fn fetch_file(&self, remote_path: &str, local_dir: &Path) -> Result<u64, CsdmError> {
        let limit = *self.fetch_limit.lock().unwrap();
        if limit.is_some_and(|limit| self.fetch_count() >= limit) {
            return Err(CsdmError::TransferFailure {
                path: remote_path.to_string(),
                message: "connection reset".to_string(),
            });
        }
        let target = local_dir.join(remote_file_name(remote_path));
        fs::write(&target, vec![0u8; self.size as usize])
            .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        self.fetched.lock().unwrap().push(remote_path.to_string());
        Ok(self.size)
    }
}

/// Writes two footprints per granule into both record classes, upserting on the key.
#[derive(Default)]
pub struct MockDecoder {
    pub fail: bool,
    pub batches: Mutex<Vec<Vec<String>>>,
}

impl MockDecoder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn decoded_files(&self) -> Vec<String> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

impl Decoder for MockDecoder {
    fn decode(
        &self,
        files: &[PathBuf],
        _field_names: &[String],
        _key_columns: &[String],
        target: &Path,
    ) -> Result<(), CsdmError> {
        let names = files
            .iter()
            .map(|file| file.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        self.batches.lock().unwrap().push(names.clone());
        if self.fail {
            return Err(CsdmError::DecodeFailure("UNIQUE constraint failed".to_string()));
        }

        let conn = Connection::open(target)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS footprint_2d (
                Latitude REAL, Longitude REAL, UTC_start REAL, Profile_time REAL,
                SurfaceHeightBin INTEGER,
                PRIMARY KEY (Latitude, Longitude, UTC_start, Profile_time)
            );
            CREATE TABLE IF NOT EXISTS footprint_3d (
                Latitude REAL, Longitude REAL, UTC_start REAL, Profile_time REAL,
                Height INTEGER, Radar_Reflectivity REAL,
                PRIMARY KEY (Latitude, Longitude, UTC_start, Profile_time, Height)
            );",
        )?;
        for file in files {
            let orbit: f64 = file
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.split('_').nth(1))
                .and_then(|orbit| orbit.parse().ok())
                .unwrap_or(0.0);
            for step in 0..2 {
                let profile = f64::from(step) * 0.16;
                let latitude = (orbit % 80.0) + f64::from(step) * 0.01;
                let longitude = orbit / 1000.0;
                conn.execute(
                    "INSERT OR REPLACE INTO footprint_2d VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![latitude, longitude, orbit, profile, 60 + step],
                )?;
                for height in [600, 1200, 1800] {
                    conn.execute(
                        "INSERT OR REPLACE INTO footprint_3d VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![latitude, longitude, orbit, profile, height, -20.0 + f64::from(height) / 100.0],
                    )?;
                }
            }
        }
        Ok(())
    }
}

pub fn test_config(root: &Path) -> ResolvedConfig {
    test_config_with(root, |_| {})
}

pub fn test_config_with(root: &Path, adjust: impl FnOnce(&mut Config)) -> ResolvedConfig {
    let mut config = Config {
        root: Some(
            Utf8PathBuf::from_path_buf(root.to_path_buf())
                .unwrap()
                .to_string(),
        ),
        global_space_limit: Some(100_000_000),
        min_job_space: Some(10_000_000),
        idle_poll_ms: Some(10),
        transfer_backoff_ms: Some(1),
        space_cache_ms: Some(0),
        download_timeout_secs: Some(30),
        ..Config::default()
    };
    adjust(&mut config);
    ConfigLoader::resolve_config(config).unwrap()
}

pub fn request_json(job_id: &str) -> String {
    format!(
        r#"{{
            "jobId": "{job_id}",
            "jobType": "Query",
            "dateRange": ["2012-02-03T00:00:00", "2012-02-04T00:00:00"],
            "filterCriteria": {{"Height": ["3d", ">=", 1200]}},
            "fieldNames": ["Height", "Radar_Reflectivity"]
        }}"#
    )
}
