use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::chunked::ChunkOptions;
use crate::error::BatchError;
use crate::executor::ExecutorOptions;

/// Upper bound on `logging.retention_days` (about a century).
pub const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_days: u64,
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_days: 14,
            logs_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorOptions,
    pub chunked: ChunkOptions,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.executor.max_concurrent == 0 {
            return Err(BatchError::InvalidConfig(
                "executor.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.logging.retention_days > MAX_RETENTION_DAYS {
            return Err(BatchError::InvalidConfig(format!(
                "logging.retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.executor.request_timeout_ms == Some(0) {
            return Err(BatchError::InvalidConfig(
                "executor.request_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    defaults: Value,
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered engine configuration: `defaults <- file <- env <- cli`.
#[derive(Clone)]
pub struct ConfigStore {
    file_path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        Self::with_env(path, cli_overrides, env_layer()).await
    }

    async fn with_env(
        path: Option<&Path>,
        cli_overrides: Option<Value>,
        env: Value,
    ) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let layers = ConfigLayers {
            defaults: serde_json::to_value(EngineConfig::default())?,
            file,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            file_path: path.map(Path::to_path_buf),
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Effective, validated configuration.
    pub async fn get(&self) -> anyhow::Result<EngineConfig> {
        let merged = self.get_effective_value().await;
        let config: EngineConfig =
            serde_json::from_value(merged).context("effective configuration is malformed")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.defaults);
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "defaults": layers.defaults,
            "file": layers.file,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    pub async fn patch_cli(&self, patch: Value) -> anyhow::Result<EngineConfig> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.cli, &patch);
        }
        self.get().await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    let value = serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    if !value.is_object() {
        anyhow::bail!("config {} must contain a JSON object", path.display());
    }
    Ok(value)
}

const ENV_NUMBERS: [(&str, &str, &str); 7] = [
    ("CANVAS_BATCH_MAX_CONCURRENT", "executor", "max_concurrent"),
    ("CANVAS_BATCH_BASE_DELAY_MS", "executor", "base_delay_ms"),
    ("CANVAS_BATCH_JITTER_MS", "executor", "jitter_ms"),
    ("CANVAS_BATCH_MAX_RETRIES", "executor", "max_retries"),
    ("CANVAS_BATCH_REQUEST_TIMEOUT_MS", "executor", "request_timeout_ms"),
    ("CANVAS_BATCH_CHUNK_SIZE", "chunked", "chunk_size"),
    ("CANVAS_BATCH_CHUNK_DELAY_MS", "chunked", "delay_ms"),
];

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    for (var, section, field) in ENV_NUMBERS {
        let Some(raw) = lookup(var) else {
            continue;
        };
        match raw.trim().parse::<u64>() {
            Ok(n) => deep_merge(&mut root, &json!({ section: { field: n } })),
            Err(_) => tracing::warn!("Ignoring {}={:?}: not a non-negative integer", var, raw),
        }
    }
    if let Some(label) = lookup("CANVAS_BATCH_CHUNK_LABEL") {
        if !label.trim().is_empty() {
            deep_merge(&mut root, &json!({ "chunked": { "label": label } }));
        }
    }
    if let Some(dir) = lookup("CANVAS_BATCH_LOGS_DIR") {
        if !dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "logging": { "logs_dir": dir } }));
        }
    }
    root
}

pub(crate) fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
