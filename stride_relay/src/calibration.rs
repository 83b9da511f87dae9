use crate::config::CalibrationConfig;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{collections::HashMap, path::PathBuf};
use thiserror::Error;
use tokio::sync::OnceCell;

const CLASS_NAME_FIELD: &str = "class_name";
const LEGACY_CLASS_ID_FIELD: &str = "class_id";
const HEIGHT_FIELD: &str = "avg_height_meters";

/// A schemaless row as returned by the config store.
pub type CalibrationRecord = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read calibration table {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed calibration table: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Calibration store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CalibrationStore: Send + Sync + 'static {
    async fn scan(&self) -> Result<Vec<CalibrationRecord>, StoreError>;
}

/// Reads the whole calibration table from a JSON array of records.
#[derive(Debug, Clone)]
pub struct FileCalibrationStore {
    path: PathBuf,
}

impl FileCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CalibrationStore for FileCalibrationStore {
    async fn scan(&self) -> Result<Vec<CalibrationRecord>, StoreError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| StoreError::Read {
                path: self.path.clone(),
                source,
            })?;
        let records: Vec<CalibrationRecord> = serde_json::from_str(&contents)?;
        Ok(records)
    }
}

pub struct CalibrationCache {
    store: Box<dyn CalibrationStore>,
    heights: OnceCell<HashMap<String, f64>>,
    default_class: String,
    default_height: f64,
}

impl CalibrationCache {
    pub fn new(store: impl CalibrationStore, config: &CalibrationConfig) -> Self {
        Self {
            store: Box::new(store),
            heights: OnceCell::new(),
            default_class: config.default_class.clone(),
            default_height: config.default_height_meters,
        }
    }

    /// Scans the store on first use. Later calls, including concurrent ones
    /// racing the first, wait for and reuse that single scan.
    pub async fn load_if_needed(&self) {
        self.heights
            .get_or_init(|| async {
                let mut heights = match self.store.scan().await {
                    Ok(records) => parse_records(&records),
                    Err(e) => {
                        tracing::error!("Error loading class height cache: {}", e);
                        HashMap::new()
                    }
                };
                if heights.is_empty() {
                    tracing::warn!(
                        "No calibration entries available, falling back to {} = {}m",
                        self.default_class,
                        self.default_height
                    );
                    heights.insert(self.default_class.clone(), self.default_height);
                }
                tracing::info!("Class height cache loaded with {} entries", heights.len());
                heights
            })
            .await;
    }

    /// Average real-world height in meters; unknown classes get the default.
    pub fn height_for(&self, class_name: &str) -> f64 {
        self.heights
            .get()
            .and_then(|heights| heights.get(class_name))
            .copied()
            .unwrap_or(self.default_height)
    }

    pub fn is_loaded(&self) -> bool {
        self.heights.initialized()
    }

    pub fn entries(&self) -> usize {
        self.heights.get().map_or(0, HashMap::len)
    }
}

fn parse_records(records: &[CalibrationRecord]) -> HashMap<String, f64> {
    let mut heights = HashMap::with_capacity(records.len());
    for record in records {
        let Some(class_name) = record
            .get(CLASS_NAME_FIELD)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
        else {
            if record.contains_key(LEGACY_CLASS_ID_FIELD) {
                tracing::debug!("Skipping calibration record keyed by legacy class_id");
            }
            continue;
        };

        match record.get(HEIGHT_FIELD).and_then(parse_height) {
            Some(height) => {
                heights.insert(class_name.to_string(), height);
            }
            None => tracing::debug!("Skipping calibration record for {}", class_name),
        }
    }
    heights
}

fn parse_height(value: &Value) -> Option<f64> {
    let height = match value {
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    (height.is_finite() && height > 0.0).then_some(height)
}
