//! Catalog watcher seam. The watcher tracks template dependencies against
//! the catalog and streams the IDs of templates whose inputs changed.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Watcher: Send + Sync {
    /// Stream changed template IDs into `events` until `cancel` fires.
    async fn watch(&self, cancel: &CancellationToken, events: mpsc::Sender<String>) -> Result<()>;

    /// Number of template handles currently tracked.
    fn size(&self) -> usize;

    /// Idempotent shutdown.
    fn stop(&self);
}
