use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use avi_adapters::ConnectorSettings;
use avi_core::{MalformedRowPolicy, SourceId};
use avi_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/ingest.yaml";

/// Everything the pipeline reads at startup. Loaded from YAML, then
/// overridden from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub sources: BTreeMap<SourceId, SourceSettings>,
    /// `DATA_GOV_API_KEY`; never read from or written to the YAML file.
    #[serde(skip)]
    pub otp_api_key: Option<String>,
    /// `NOAA_USER_AGENT`; the weather service asks for a contact address.
    #[serde(skip)]
    pub noaa_user_agent: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http: HttpSettings::default(),
            sources: SourceId::ALL
                .into_iter()
                .map(|id| (id, SourceSettings::builtin(id)))
                .collect(),
            otp_api_key: None,
            noaa_user_agent: None,
        }
    }
}

impl IngestConfig {
    /// Reads `path`, or returns the built-in defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let path = std::env::var("AVI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `AVI_DATA_DIR`, `AVI_HTTP_TIMEOUT_SECS`, `NOAA_USER_AGENT`
    /// and `DATA_GOV_API_KEY` from `lookup`. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = get("AVI_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = get("AVI_HTTP_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.http.timeout_secs = secs;
        }
        if let Some(agent) = get("NOAA_USER_AGENT") {
            self.noaa_user_agent = Some(agent);
        }
        if let Some(key) = get("DATA_GOV_API_KEY") {
            self.otp_api_key = Some(key);
        }
    }

    /// Configured settings for `source_id`, or its built-in defaults.
    pub fn source(&self, source_id: SourceId) -> SourceSettings {
        self.sources
            .get(&source_id)
            .cloned()
            .unwrap_or_else(|| SourceSettings::builtin(source_id))
    }

    pub fn connector_settings(&self, source_id: SourceId) -> ConnectorSettings {
        let source = self.source(source_id);
        ConnectorSettings {
            base_url: source.base_url,
            api_key: match source_id {
                SourceId::Otp => self.otp_api_key.clone(),
                _ => None,
            },
            user_agent: match source_id {
                SourceId::Metar => self.noaa_user_agent.clone(),
                _ => None,
            },
            page_size: source.page_size,
            max_pages: source.max_pages,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs.max(1)),
            user_agent: self.http.user_agent.clone().or(defaults.user_agent),
            backoff: BackoffPolicy {
                max_retries: self.http.max_retries,
                base_delay: Duration::from_millis(self.http.base_delay_ms),
                max_delay: Duration::from_millis(self.http.max_delay_ms),
            },
            token_bucket: self
                .http
                .requests_per_second
                .filter(|rps| *rps > 0)
                .map(|rps| TokenBucketConfig {
                    capacity: rps,
                    refill_every: Duration::from_millis((1_000 / u64::from(rps)).max(1)),
                }),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("manifest.jsonl")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    pub fn ingest_log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("ingest.log")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub requests_per_second: Option<u32>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            user_agent: None,
            max_retries: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            requests_per_second: Some(4),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_stations: Vec<String>,
    /// No default: every configured source states how malformed rows are handled.
    pub malformed_rows: MalformedRowPolicy,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub validation: ValidationSettings,
}

impl SourceSettings {
    pub fn builtin(source_id: SourceId) -> Self {
        match source_id {
            SourceId::Otp => Self {
                base_url: None,
                default_stations: Vec::new(),
                malformed_rows: MalformedRowPolicy::Drop,
                page_size: Some(1_000),
                max_pages: Some(500),
                validation: ValidationSettings {
                    bounds: vec![
                        BoundSpec::new("dep_delay_min", Some(-120.0), Some(2_880.0)).tolerating(10, 0.01),
                        BoundSpec::new("arr_delay_min", Some(-120.0), Some(2_880.0)).tolerating(10, 0.01),
                    ],
                    ..ValidationSettings::default()
                },
            },
            SourceId::Metar => Self {
                base_url: None,
                default_stations: vec!["KJFK".to_string()],
                malformed_rows: MalformedRowPolicy::Drop,
                page_size: None,
                max_pages: None,
                validation: ValidationSettings {
                    max_null_ratio: 0.25,
                    bounds: vec![
                        BoundSpec::new("temp_c", Some(-80.0), Some(60.0)),
                        BoundSpec::new("wind_speed_kt", Some(0.0), Some(150.0)).tolerating(0, 0.0),
                        BoundSpec::new("wind_gust_kt", Some(0.0), Some(200.0)).tolerating(0, 0.0),
                        BoundSpec::new("visibility_statute_mi", Some(0.0), Some(15.0)).tolerating(5, 0.05),
                        BoundSpec::new("ceiling_ft_agl", Some(0.0), Some(20_000.0)).tolerating(5, 0.05),
                    ],
                    categories: vec![CategorySpec {
                        column: "flight_category".to_string(),
                        allowed: ["VFR", "MVFR", "IFR", "LIFR"].map(String::from).to_vec(),
                        blocking: false,
                    }],
                    ..ValidationSettings::default()
                },
            },
            SourceId::Tsa => Self {
                base_url: None,
                default_stations: Vec::new(),
                malformed_rows: MalformedRowPolicy::Abort,
                page_size: None,
                max_pages: None,
                validation: ValidationSettings {
                    bounds: vec![BoundSpec::new("travelers", Some(0.0), Some(4_000_000.0))],
                    ..ValidationSettings::default()
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Share of requested days that must be present; below is blocking.
    pub min_coverage: f64,
    /// Below this (but above `min_coverage`) coverage is only a warning.
    pub warn_coverage: f64,
    pub max_null_ratio: f64,
    pub null_ratio_blocking: bool,
    pub duplicate_sample_size: usize,
    pub bounds: Vec<BoundSpec>,
    pub categories: Vec<CategorySpec>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_coverage: 0.95,
            warn_coverage: 1.0,
            max_null_ratio: 0.05,
            null_ratio_blocking: false,
            duplicate_sample_size: 5,
            bounds: Vec::new(),
            categories: Vec::new(),
        }
    }
}

/// Numeric sanity bound. Violations beyond `max_violations` or
/// `max_violation_ratio` block; fewer are reported as a warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundSpec {
    pub column: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub max_violations: usize,
    #[serde(default)]
    pub max_violation_ratio: Option<f64>,
}

impl BoundSpec {
    pub fn new(column: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            column: column.to_string(),
            min,
            max,
            max_violations: 0,
            max_violation_ratio: None,
        }
    }

    pub fn tolerating(mut self, max_violations: usize, max_violation_ratio: f64) -> Self {
        self.max_violations = max_violations;
        self.max_violation_ratio = Some(max_violation_ratio);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySpec {
    pub column: String,
    pub allowed: Vec<String>,
    #[serde(default)]
    pub blocking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_source() {
        let config = IngestConfig::default();
        for id in SourceId::ALL {
            assert!(config.sources.contains_key(&id), "{id} missing");
        }
        assert_eq!(config.source(SourceId::Tsa).malformed_rows, MalformedRowPolicy::Abort);
        assert_eq!(config.manifest_path(), PathBuf::from("./data/manifest.jsonl"));
    }

    #[test]
    fn yaml_requires_an_explicit_malformed_row_policy() {
        let err = IngestConfig::from_yaml("sources:\n  tsa:\n    base_url: http://localhost/tsa.csv\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("malformed_rows"));

        let config = IngestConfig::from_yaml(
            "data_dir: /tmp/avi\nsources:\n  tsa:\n    malformed_rows: drop\n    validation:\n      min_coverage: 0.6\n",
        )
        .unwrap();
        let tsa = config.source(SourceId::Tsa);
        assert_eq!(tsa.malformed_rows, MalformedRowPolicy::Drop);
        assert_eq!(tsa.validation.min_coverage, 0.6);
        assert_eq!(tsa.validation.warn_coverage, 1.0);
        // sources absent from the file keep their built-in settings
        assert_eq!(config.source(SourceId::Metar), SourceSettings::builtin(SourceId::Metar));
    }

    #[test]
    fn shipped_config_parses_for_every_source() {
        let config = IngestConfig::from_yaml(include_str!("../../../config/ingest.yaml")).unwrap();
        for id in SourceId::ALL {
            let shipped = &config.sources[&id];
            let builtin = SourceSettings::builtin(id);
            assert_eq!(shipped.malformed_rows, builtin.malformed_rows, "{id}");
            assert_eq!(shipped.validation.bounds.len(), builtin.validation.bounds.len(), "{id}");
        }
        assert_eq!(config.http, HttpSettings::default());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = IngestConfig::default();
        let env: BTreeMap<&str, &str> = [
            ("AVI_DATA_DIR", "/var/lib/avi"),
            ("AVI_HTTP_TIMEOUT_SECS", "45"),
            ("NOAA_USER_AGENT", "ops@example.com"),
            ("DATA_GOV_API_KEY", "  "),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/avi"));
        assert_eq!(config.http.timeout_secs, 45);
        assert_eq!(config.otp_api_key, None);
        let metar = config.connector_settings(SourceId::Metar);
        assert_eq!(metar.user_agent.as_deref(), Some("ops@example.com"));
        assert_eq!(config.connector_settings(SourceId::Tsa).user_agent, None);
    }

    #[test]
    fn http_settings_map_onto_client_config() {
        let config = IngestConfig::default();
        let client = config.http_client_config();
        assert_eq!(client.timeout, Duration::from_secs(20));
        assert_eq!(client.backoff.max_retries, 4);
        let bucket = client.token_bucket.unwrap();
        assert_eq!(bucket.capacity, 4);
        assert_eq!(bucket.refill_every, Duration::from_millis(250));
    }
}
