use std::{env, fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub probes: Vec<ProbeConfig>,
    pub api: ApiConfig,
    pub gmp: GmpConfig,
    pub scan: ScanConfig,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            probes: vec![ProbeConfig::default()],
            api: ApiConfig::default(),
            gmp: GmpConfig::default(),
            scan: ScanConfig::default(),
            source: SourceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            name: "gvm-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9390,
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Engine client tuning shared by every probe connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmpConfig {
    pub timeout: u64,
    pub retry_attempts: u32,
    pub retry_delay: u64,
}

impl Default for GmpConfig {
    fn default() -> Self {
        Self {
            timeout: 300,
            retry_attempts: 3,
            retry_delay: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub poll_interval: u64,
    pub max_duration: u64,
    pub cleanup_after_report: bool,
    pub max_consecutive_same_probe: usize,
    pub gvm_scan_config: String,
    pub gvm_scanner: String,
    pub default_port_list: String,
    pub db_path: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            poll_interval: 30,
            max_duration: 86_400,
            cleanup_after_report: true,
            max_consecutive_same_probe: 3,
            gvm_scan_config: "Full and fast".to_string(),
            gvm_scanner: "OpenVAS Default".to_string(),
            default_port_list: "All IANA assigned TCP".to_string(),
            db_path: "scans.db".to_string(),
        }
    }
}

/// Upstream inventory coupling. Sync and scheduler only run when `url` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub sync_interval: u64,
    pub callback_url: Option<String>,
    pub timeout: u64,
    pub scheduler_interval: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            sync_interval: 300,
            callback_url: None,
            timeout: 30,
            scheduler_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "console".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        override_string("API_HOST", &mut self.api.host);
        override_parsed("API_PORT", &mut self.api.port);
        override_parsed("GMP_TIMEOUT", &mut self.gmp.timeout);
        override_parsed("GMP_RETRY_ATTEMPTS", &mut self.gmp.retry_attempts);
        override_parsed("GMP_RETRY_DELAY", &mut self.gmp.retry_delay);
        override_parsed("SCAN_POLL_INTERVAL", &mut self.scan.poll_interval);
        override_parsed("SCAN_MAX_DURATION", &mut self.scan.max_duration);
        override_string("SCAN_DEFAULT_PORT_LIST", &mut self.scan.default_port_list);
        override_string("SCAN_DB_PATH", &mut self.scan.db_path);
        if let Ok(v) = env::var("SCAN_CLEANUP") {
            self.scan.cleanup_after_report = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Ok(v) = env::var("SOURCE_URL") {
            if !v.is_empty() {
                self.source.url = Some(v);
            }
        }
        if let Ok(v) = env::var("SOURCE_AUTH_TOKEN") {
            if !v.is_empty() {
                self.source.auth_token = Some(v);
            }
        }
        override_string("LOG_LEVEL", &mut self.logging.level);
        override_string("LOG_FORMAT", &mut self.logging.format);
    }
}

fn override_string(key: &str, slot: &mut String) {
    if let Ok(v) = env::var(key) {
        if !v.is_empty() {
            *slot = v;
        }
    }
}

fn override_parsed<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *slot = parsed;
        }
    }
}
