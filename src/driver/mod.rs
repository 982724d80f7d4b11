//! Driver seam between the controller and the infrastructure executor.

pub mod registry;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::Task;

pub use registry::Drivers;

/// Externally provided handle that executes render+apply for one task.
///
/// `apply_task` must be idempotent at the semantic level; `destroy_task` is
/// best-effort cleanup and never fails.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Descriptor of the task this driver is bound to.
    fn task(&self) -> Task;

    /// Template IDs feeding this task. Stable over the task's lifetime.
    fn template_ids(&self) -> Vec<String>;

    /// One-time setup, called at registration.
    async fn init_task(&self, cancel: &CancellationToken) -> Result<()>;

    /// Render the task's templates. `Ok(false)` means the inputs are not
    /// ready yet.
    async fn render_template(&self, cancel: &CancellationToken) -> Result<bool>;

    /// Apply the rendered configuration.
    async fn apply_task(&self, cancel: &CancellationToken) -> Result<()>;

    /// Best-effort teardown on task removal.
    async fn destroy_task(&self, cancel: &CancellationToken);

    /// Advisory render debounce hint.
    fn set_buffer_period(&self);
}

/// Builds a driver for a task at init time.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn new_driver(&self, config: &Config, task: Task) -> Result<Arc<dyn Driver>>;
}
