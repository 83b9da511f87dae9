use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub inference: InferenceConfig,
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    pub endpoint: String,
    #[serde(default = "default_inference_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_inference_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_inference_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    pub table_path: PathBuf,
    #[serde(default = "default_class")]
    pub default_class: String,
    #[serde(default = "default_height_meters")]
    pub default_height_meters: f64,
    #[serde(default = "default_focal_length")]
    pub focal_length: f64,
}

fn default_class() -> String {
    "person".to_string()
}

fn default_height_meters() -> f64 {
    1.7
}

fn default_focal_length() -> f64 {
    800.0
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.default_class.trim().is_empty() {
            return Err("calibration.default_class must not be empty".to_string());
        }
        if !(self.default_height_meters.is_finite() && self.default_height_meters > 0.0) {
            return Err(format!(
                "calibration.default_height_meters must be positive, got {}",
                self.default_height_meters
            ));
        }
        if !(self.focal_length.is_finite() && self.focal_length > 0.0) {
            return Err(format!(
                "calibration.focal_length must be positive, got {}",
                self.focal_length
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default = "default_push_timeout_secs")]
    pub push_timeout_secs: u64,
    /// Overrides the per-event callback address for remote pushes.
    #[serde(default)]
    pub management_endpoint: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            stage: default_stage(),
            push_timeout_secs: default_push_timeout_secs(),
            management_endpoint: None,
        }
    }
}

fn default_stage() -> String {
    "prod".to_string()
}

fn default_push_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("cannot read current dir: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("STRIDE")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.calibration.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
