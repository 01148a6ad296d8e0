use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::CsdmError;
use crate::workspace::Workspace;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_PRODUCT: &str = "2B-GEOPROF.P1_R05";
pub const ARCHIVE_HOST: &str = "www.cloudsat.cira.colostate.edu";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub global_space_limit: Option<u64>,
    #[serde(default)]
    pub min_job_space: Option<u64>,
    #[serde(default)]
    pub allocation_policy: Option<AllocationPolicy>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub supervise_interval_secs: Option<u64>,
    #[serde(default)]
    pub intake_interval_secs: Option<u64>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
    #[serde(default)]
    pub parse_timeout_secs: Option<u64>,
    #[serde(default)]
    pub idle_poll_ms: Option<u64>,
    #[serde(default)]
    pub parse_batch_size: Option<usize>,
    #[serde(default)]
    pub max_decode_failures: Option<u32>,
    #[serde(default)]
    pub transfer_retries: Option<u32>,
    #[serde(default)]
    pub transfer_backoff_ms: Option<u64>,
    #[serde(default)]
    pub preview_rows: Option<usize>,
    #[serde(default)]
    pub space_cache_ms: Option<u64>,
    #[serde(default)]
    pub archive: Option<ArchiveEntry>,
    #[serde(default)]
    pub decoder: Option<DecoderSettings>,
    #[serde(default)]
    pub default_product: Option<String>,
    #[serde(default)]
    pub key_columns: Option<Vec<String>>,
    #[serde(default)]
    pub products: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub reference_geometry: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationPolicy {
    /// Every job receives `min_job_space`, whatever the remaining budget.
    Fixed,
    /// Every job receives the larger of `min_job_space` and half the remaining budget.
    Proportional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveProtocol {
    Sftp,
    Http,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ArchiveEntry {
    #[serde(default)]
    pub protocol: Option<ArchiveProtocol>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub max_search_depth: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Seconds a cached listing stays valid; `0` keeps listings until refreshed.
    #[serde(default)]
    pub listing_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSettings {
    pub protocol: ArchiveProtocol,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub username: Option<String>,
    pub max_search_depth: usize,
    pub timeout_secs: u64,
    pub listing_ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DecoderSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Knobs a running job needs; cloned into every job at admission.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download_timeout: Duration,
    pub parse_timeout: Option<Duration>,
    pub idle_poll: Duration,
    pub parse_batch_size: usize,
    pub max_decode_failures: u32,
    pub transfer_retries: u32,
    pub transfer_backoff: Duration,
    pub preview_rows: usize,
    pub key_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub root: Utf8PathBuf,
    pub global_space_limit: u64,
    pub min_job_space: u64,
    pub allocation_policy: AllocationPolicy,
    pub max_attempts: Option<u32>,
    pub supervise_interval: Duration,
    pub intake_interval: Duration,
    pub space_cache: Duration,
    pub pipeline: PipelineSettings,
    pub archive: ArchiveSettings,
    pub decoder: Option<DecoderSettings>,
    pub default_product: String,
    pub products: BTreeMap<String, Vec<String>>,
    pub reference_geometry: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.root.clone())
    }

    /// Expands `*` to the product's known fields when the product is catalogued.
    pub fn expand_fields(&self, product: &str, fields: &[String]) -> Vec<String> {
        if fields.iter().any(|field| field == "*") {
            if let Some(known) = self.products.get(product) {
                return known.clone();
            }
            tracing::warn!(product, "no field catalogue for product; passing `*` to decoder");
            return vec!["*".to_string()];
        }
        fields.to_vec()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CsdmError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("csdm.json"),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(CsdmError::ConfigRead(config_path));
            }
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CsdmError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CsdmError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CsdmError> {
        let root = match config.root {
            Some(root) => Utf8PathBuf::from(root),
            None => Workspace::default_root()?,
        };

        let parse_batch_size = config.parse_batch_size.unwrap_or(15);
        if parse_batch_size == 0 {
            return Err(CsdmError::ConfigParse(
                "parse_batch_size must be positive".to_string(),
            ));
        }

        let archive = config.archive.unwrap_or_default();
        let archive = ArchiveSettings {
            protocol: archive.protocol.unwrap_or(ArchiveProtocol::Sftp),
            host: archive.host.unwrap_or_else(|| ARCHIVE_HOST.to_string()),
            port: archive.port.unwrap_or(22),
            base_url: archive
                .base_url
                .unwrap_or_else(|| format!("https://{ARCHIVE_HOST}/archive")),
            username: archive.username,
            max_search_depth: archive.max_search_depth.unwrap_or(3),
            timeout_secs: archive.timeout_secs.unwrap_or(300),
            listing_ttl: match archive.listing_ttl_secs.unwrap_or(24 * 60 * 60) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };

        let mut products = default_products();
        products.extend(config.products);

        Ok(ResolvedConfig {
            root,
            global_space_limit: config.global_space_limit.unwrap_or(200 * GIB),
            min_job_space: config.min_job_space.unwrap_or(10 * GIB),
            allocation_policy: config.allocation_policy.unwrap_or(AllocationPolicy::Fixed),
            max_attempts: config.max_attempts,
            supervise_interval: Duration::from_secs(config.supervise_interval_secs.unwrap_or(30)),
            intake_interval: Duration::from_secs(config.intake_interval_secs.unwrap_or(1)),
            space_cache: Duration::from_millis(config.space_cache_ms.unwrap_or(5_000)),
            pipeline: PipelineSettings {
                download_timeout: Duration::from_secs(
                    config.download_timeout_secs.unwrap_or(24 * 60 * 60),
                ),
                parse_timeout: config.parse_timeout_secs.map(Duration::from_secs),
                idle_poll: Duration::from_millis(config.idle_poll_ms.unwrap_or(2_000)),
                parse_batch_size,
                max_decode_failures: config.max_decode_failures.unwrap_or(5),
                transfer_retries: config.transfer_retries.unwrap_or(4),
                transfer_backoff: Duration::from_millis(config.transfer_backoff_ms.unwrap_or(500)),
                preview_rows: config.preview_rows.unwrap_or(5_000),
                key_columns: config.key_columns.unwrap_or_else(default_key_columns),
            },
            archive,
            decoder: config.decoder,
            default_product: config
                .default_product
                .unwrap_or_else(|| DEFAULT_PRODUCT.to_string()),
            products,
            reference_geometry: config.reference_geometry.map(PathBuf::from),
        })
    }
}

pub fn default_key_columns() -> Vec<String> {
    ["Latitude", "Longitude", "UTC_start", "Profile_time"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_products() -> BTreeMap<String, Vec<String>> {
    let geoprof = [
        "Height",
        "CPR_Cloud_mask",
        "Radar_Reflectivity",
        "Gaseous_Attenuation",
        "Sigma-Zero",
        "SurfaceHeightBin",
    ];
    let cpr = ["Height", "ReceivedEchoPowers", "Noise_Level", "DEM_elevation"];
    BTreeMap::from([
        (
            "2B-GEOPROF.P1_R05".to_string(),
            geoprof.into_iter().map(str::to_string).collect(),
        ),
        (
            "1B-CPR.P_R05".to_string(),
            cpr.into_iter().map(str::to_string).collect(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_preserve_fixed_allocation() {
        let config = Config {
            root: Some("/tmp/csdm".to_string()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.allocation_policy, AllocationPolicy::Fixed);
        assert_eq!(resolved.min_job_space, 10 * GIB);
        assert_eq!(resolved.pipeline.parse_batch_size, 15);
        assert_eq!(resolved.pipeline.parse_timeout, None);
        assert_eq!(resolved.pipeline.key_columns, default_key_columns());
        assert_eq!(resolved.default_product, DEFAULT_PRODUCT);
        assert_eq!(resolved.archive.protocol, ArchiveProtocol::Sftp);
        assert_eq!(resolved.archive.host, ARCHIVE_HOST);
        assert_eq!(resolved.archive.port, 22);
        assert_eq!(resolved.archive.listing_ttl, Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn archive_protocol_and_listing_ttl_are_configurable() {
        let config: Config = serde_json::from_str(
            r#"{"root": "/tmp/csdm", "archive": {"protocol": "http", "listing_ttl_secs": 0}}"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.archive.protocol, ArchiveProtocol::Http);
        assert_eq!(resolved.archive.listing_ttl, None);
        assert_eq!(
            resolved.archive.base_url,
            "https://www.cloudsat.cira.colostate.edu/archive"
        );
    }

    #[test]
    fn star_expands_to_catalogued_fields() {
        let config = Config {
            root: Some("/tmp/csdm".to_string()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        let fields = resolved.expand_fields("2B-GEOPROF.P1_R05", &["*".to_string()]);
        assert!(fields.contains(&"Radar_Reflectivity".to_string()));
        let unknown = resolved.expand_fields("9Z-UNKNOWN", &["*".to_string()]);
        assert_eq!(unknown, vec!["*"]);
        let explicit = resolved.expand_fields("9Z-UNKNOWN", &["Height".to_string()]);
        assert_eq!(explicit, vec!["Height"]);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = Config {
            root: Some("/tmp/csdm".to_string()),
            parse_batch_size: Some(0),
            ..Config::default()
        };
        assert!(ConfigLoader::resolve_config(config).is_err());
    }
}
