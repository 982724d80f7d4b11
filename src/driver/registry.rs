//! Registry of drivers plus the per-task execution guard.
//!
//! Exclusion lives here as an active set with a broadcast, not as a lock
//! inside each driver: callers reserve a task name, run, then release it.
//! No lock is held across driver calls.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;
use crate::engine::EngineError;

#[derive(Default)]
struct Inner {
    drivers: HashMap<String, Arc<dyn Driver>>,
    /// Task names currently executing.
    active: HashSet<String>,
}

/// Thread-safe map of task name to driver with an active set.
pub struct Drivers {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl Default for Drivers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drivers {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Result<(), EngineError> {
        let name = name.into();
        let mut inner = self.lock();
        if inner.drivers.contains_key(&name) {
            return Err(EngineError::AlreadyRegistered(name));
        }
        inner.drivers.insert(name, driver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.lock().drivers.get(name).cloned()
    }

    /// Remove a driver, clearing its guard bookkeeping and waking waiters.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Driver>> {
        let removed = {
            let mut inner = self.lock();
            inner.active.remove(name);
            inner.drivers.remove(name)
        };
        self.changed.notify_waiters();
        removed
    }

    pub fn map(&self) -> HashMap<String, Arc<dyn Driver>> {
        self.lock().drivers.clone()
    }

    /// Registered task names in sorted order.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().drivers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().drivers.is_empty()
    }

    /// Find the dynamic task watching a template. Scheduled tasks ignore
    /// template notifications.
    pub fn get_task_by_template(&self, template_id: &str) -> Option<(String, Arc<dyn Driver>)> {
        let snapshot = self.map();
        snapshot.into_iter().find(|(_, driver)| {
            !driver.task().is_scheduled()
                && driver.template_ids().iter().any(|id| id == template_id)
        })
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.lock().active.contains(name)
    }

    /// Mark a task as executing. Returns false if it already was.
    pub fn set_active(&self, name: &str) -> bool {
        self.lock().active.insert(name.to_string())
    }

    /// Clear the executing mark and wake anything waiting on the task.
    pub fn set_inactive(&self, name: &str) -> bool {
        let removed = self.lock().active.remove(name);
        self.changed.notify_waiters();
        removed
    }

    /// Block until the task is not executing or `cancel` fires. Unknown
    /// names return immediately.
    pub async fn wait_for_inactive(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<(), EngineError> {
        let notified = self.changed.notified();
        tokio::pin!(notified);
        loop {
            // Register for the next broadcast before checking, so a release
            // between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if !inner.drivers.contains_key(name) || !inner.active.contains(name) {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = notified.as_mut() => {}
            }
            notified.set(self.changed.notified());
        }
    }

    /// Forward the render debounce hint to every registered driver.
    pub fn set_buffer_period(&self) {
        for driver in self.map().values() {
            driver.set_buffer_period();
        }
    }
}
