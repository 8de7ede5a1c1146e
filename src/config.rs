use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::inference::YoloParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store_config: StoreConfig,
    pub model_config: ModelConfig,
    pub poll_config: PollConfig,
    pub taxonomy_path: PathBuf,
    /// `host:port` for the /health and /metrics endpoint; disabled when unset
    pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub init_schema: bool,
    pub connect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    /// Tag written on every detection row and used to select unprocessed work
    pub model_version: String,
    pub class_names_path: Option<PathBuf>,
    pub params: YoloParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval_secs: u64,
    /// Maximum panoramas per cycle, 0 for no limit
    pub batch_limit: usize,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `load` uses the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // Store
        let db_path = PathBuf::from(get("DB_PATH", "./data/panoramas.db"));
        let init_schema = get("STORE_INIT_SCHEMA", "false").parse().unwrap_or(false);
        let connect_attempts = get("STORE_CONNECT_ATTEMPTS", "5")
            .parse()
            .unwrap_or(5u32)
            .max(1);

        // Model
        let model_path = PathBuf::from(get("MODEL_PATH", "./models/detector.onnx"));
        let model_version = get("MODEL_VERSION", "detector-v1").trim().to_string();
        if model_version.is_empty() {
            return Err(ConfigError::Missing("MODEL_VERSION"));
        }
        let class_names_path = lookup("CLASS_NAMES_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let defaults = YoloParams::default();
        let input_size: u32 = get("MODEL_INPUT_SIZE", "640").parse().unwrap_or(defaults.input_size);
        if input_size == 0 {
            return Err(ConfigError::Invalid {
                key: "MODEL_INPUT_SIZE",
                value: input_size.to_string(),
            });
        }
        let score_floor = parse_unit("MODEL_SCORE_FLOOR", &get("MODEL_SCORE_FLOOR", "0.25"))?;
        let iou_threshold = parse_unit("MODEL_IOU_THRESHOLD", &get("MODEL_IOU_THRESHOLD", "0.45"))?;

        // Poll loop
        let interval_secs = get("POLL_INTERVAL_SECS", "8").parse().unwrap_or(8);
        let batch_limit = get("BATCH_LIMIT", "0").parse().unwrap_or(0);

        let taxonomy_path = PathBuf::from(get("TAXONOMY_PATH", "./taxonomy.json"));
        let metrics_bind = lookup("METRICS_BIND").filter(|s| !s.is_empty());

        Ok(Self {
            store_config: StoreConfig {
                db_path,
                init_schema,
                connect_attempts,
            },
            model_config: ModelConfig {
                model_path,
                model_version,
                class_names_path,
                params: YoloParams {
                    input_size,
                    score_floor,
                    iou_threshold,
                    ..defaults
                },
            },
            poll_config: PollConfig {
                interval_secs,
                batch_limit,
            },
            taxonomy_path,
            metrics_bind,
        })
    }
}

fn parse_unit(key: &'static str, value: &str) -> Result<f32, ConfigError> {
    match value.parse::<f32>() {
        Ok(v) if (0.0..=1.0).contains(&v) => Ok(v),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.poll_config.interval(), Duration::from_secs(8));
        assert_eq!(config.poll_config.batch_limit, 0);
        assert_eq!(config.model_config.model_version, "detector-v1");
        assert_eq!(config.model_config.params.input_size, 640);
        assert!(config.model_config.class_names_path.is_none());
        assert!(!config.store_config.init_schema);
        assert_eq!(config.store_config.connect_attempts, 5);
        assert!(config.metrics_bind.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("DB_PATH", "/srv/pano.db"),
            ("POLL_INTERVAL_SECS", "30"),
            ("MODEL_VERSION", "yolov8m-2024-06"),
            ("MODEL_SCORE_FLOOR", "0.05"),
            ("BATCH_LIMIT", "25"),
            ("STORE_INIT_SCHEMA", "true"),
            ("CLASS_NAMES_PATH", "/srv/labels.txt"),
            ("METRICS_BIND", "127.0.0.1:9100"),
        ])
        .unwrap();
        assert_eq!(config.store_config.db_path, PathBuf::from("/srv/pano.db"));
        assert_eq!(config.poll_config.interval_secs, 30);
        assert_eq!(config.poll_config.batch_limit, 25);
        assert_eq!(config.model_config.model_version, "yolov8m-2024-06");
        assert!((config.model_config.params.score_floor - 0.05).abs() < 1e-6);
        assert!(config.store_config.init_schema);
        assert_eq!(
            config.model_config.class_names_path,
            Some(PathBuf::from("/srv/labels.txt"))
        );
        assert_eq!(config.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
    }

    #[test]
    fn test_unparseable_numbers_fall_back() {
        let config = from_map(&[("POLL_INTERVAL_SECS", "soon"), ("STORE_CONNECT_ATTEMPTS", "0")])
            .unwrap();
        assert_eq!(config.poll_config.interval_secs, 8);
        assert_eq!(config.store_config.connect_attempts, 1);
    }

    #[test]
    fn test_blank_model_version_rejected() {
        let err = from_map(&[("MODEL_VERSION", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("MODEL_VERSION")));
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let err = from_map(&[("MODEL_IOU_THRESHOLD", "1.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MODEL_IOU_THRESHOLD", .. }));
    }
}
