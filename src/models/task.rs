use serde::{Deserialize, Serialize};

/// What causes a task to run.
///
/// `None` behaves like `Dynamic` with no templates of its own; the driver
/// decides which templates feed the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    #[default]
    None,
    /// Re-render and apply whenever one of the listed templates changes.
    Dynamic {
        #[serde(default)]
        template_ids: Vec<String>,
    },
    /// Render and apply on each cron tick.
    Scheduled { cron: String },
}

impl Condition {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Condition::Scheduled { .. })
    }
}

/// A named reconciliation unit bound to one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
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

impl Task {
    pub fn is_scheduled(&self) -> bool {
        self.condition.is_scheduled()
    }

    /// Template IDs this task watches. Empty for scheduled tasks and for
    /// dynamic tasks whose templates are resolved by the driver.
    pub fn template_ids(&self) -> &[String] {
        match &self.condition {
            Condition::Dynamic { template_ids } => template_ids,
            _ => &[],
        }
    }
}
