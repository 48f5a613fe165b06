use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Mock,
}

impl TransportKind {
    pub fn from_environment() -> Option<Self> {
        match std::env::var("JUGAAD_TRANSPORT") {
            Ok(value) if value.eq_ignore_ascii_case("mock") => Some(Self::Mock),
            Ok(value) if value.eq_ignore_ascii_case("http") => Some(Self::Http),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub health_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            health_interval: DEFAULT_HEALTH_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Wait before re-probing after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportKind,
    pub api_base_url: Url,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub monitor: MonitorSettings,
    pub retry: RetryPolicy,
    pub storage_path: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("client configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("Configuration problem: {detail}. Update jugaad.yaml."),
        }
    }
}

impl ClientConfig {
    /// Defaults, then `jugaad.yaml`, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let section = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err| {
                    ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
                })?;
                let config: JugaadConfig = serde_yaml::from_str(&contents)
                    .map_err(|err| ConfigError::Invalid(format!("invalid jugaad.yaml: {err}")))?;
                config.client.unwrap_or_default()
            }
            None => ClientSection::default(),
        };
        let mut config = resolve_client_settings(section)?;
        apply_environment(&mut config)?;
        Ok(config)
    }

    /// Built-in settings before `jugaad.yaml` and the environment apply.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Ok(Self {
            transport: TransportKind::Http,
            api_base_url: parse_url(DEFAULT_API_URL)?,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            monitor: MonitorSettings::default(),
            retry: RetryPolicy::default(),
            storage_path: default_storage_dir(),
        })
    }

    pub fn mock() -> Result<Self, ConfigError> {
        Ok(Self {
            transport: TransportKind::Mock,
            storage_path: None,
            ..Self::with_defaults()?
        })
    }
}

fn apply_environment(config: &mut ClientConfig) -> Result<(), ConfigError> {
    if let Ok(url) = std::env::var("JUGAAD_API_URL") {
        config.api_base_url = parse_url(&url)?;
    }
    if let Some(kind) = TransportKind::from_environment() {
        config.transport = kind;
    }
    Ok(())
}

fn resolve_client_settings(section: ClientSection) -> Result<ClientConfig, ConfigError> {
    let defaults = ClientConfig::with_defaults()?;
    let api_base_url = match section.api_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => parse_url(url)?,
        _ => defaults.api_base_url,
    };

    let retry = section.retry.unwrap_or_default();
    let max_attempts = retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    if max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "retry.max_attempts must be at least 1".to_string(),
        ));
    }

    let monitor = section.monitor.unwrap_or_default();
    let health_interval = monitor
        .health_interval_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_HEALTH_INTERVAL);
    if health_interval.is_zero() {
        return Err(ConfigError::Invalid(
            "monitor.health_interval_secs must be positive".to_string(),
        ));
    }

    Ok(ClientConfig {
        transport: section.transport.unwrap_or(defaults.transport),
        api_base_url,
        request_timeout: section
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout),
        connect_timeout: section
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout),
        monitor: MonitorSettings {
            health_interval,
            reconnect_delay: monitor
                .reconnect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECONNECT_DELAY),
        },
        retry: RetryPolicy {
            max_attempts,
            backoff_base: retry
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF_BASE),
        },
        storage_path: section.storage_dir.or(defaults.storage_path),
    })
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("invalid api_url `{raw}`: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::Invalid(format!(
            "api_url must use http or https, found `{other}`"
        ))),
    }
}

pub fn default_storage_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "jugaad").map(|dirs| dirs.data_dir().to_path_buf())
}

fn locate_config_file() -> Option<PathBuf> {
    jugaad_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn jugaad_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("jugaad.yaml"), PathBuf::from("jugaad.yml")];
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("jugaad");
        paths.push(config_dir.join("jugaad.yaml"));
        paths.push(config_dir.join("jugaad.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".jugaad").join("jugaad.yaml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct JugaadConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    transport: Option<TransportKind>,
    api_url: Option<String>,
    request_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    storage_dir: Option<PathBuf>,
    monitor: Option<MonitorSection>,
    retry: Option<RetrySection>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitorSection {
    health_interval_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrySection {
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
}
