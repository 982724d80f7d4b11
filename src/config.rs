//! Core configuration options. Parsing and validation of the full config
//! file belong to the outer layers; only the options the engine consumes
//! are modeled here.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::{Condition, Task};

/// Default retry budget for task applies and catalog calls.
pub const DEFAULT_MAX_RETRIES: i64 = 8;

const fn default_enabled() -> bool {
    true
}

fn default_catalog_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

/// Connection settings for the service catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_address")]
    pub address: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            address: default_catalog_address(),
            token: None,
        }
    }
}

/// Per-task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl TaskConfig {
    pub fn to_task(&self) -> Task {
        Task {
            name: self.name.clone(),
            enabled: self.enabled,
            condition: self.condition.clone(),
            providers: self.providers.clone(),
            module: self.module.clone(),
            version: self.version.clone(),
        }
    }
}

/// Options recognized by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retries after the initial attempt; `-1` retries until cancelled.
    pub max_retries: i64,
    /// Seed for retry jitter. Defaults to wall clock when unset.
    pub seed: Option<u64>,
    /// Forward the render debounce hint to drivers at daemon start.
    pub buffer_period: bool,
    pub catalog: CatalogConfig,
    pub tasks: Vec<TaskConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            seed: None,
            buffer_period: true,
            catalog: CatalogConfig::default(),
            tasks: Vec::new(),
        }
    }
}

impl Config {
    /// Seed for the retry jitter source.
    pub fn retry_seed(&self) -> u64 {
        self.seed
            .unwrap_or_else(|| Utc::now().timestamp_millis() as u64)
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
