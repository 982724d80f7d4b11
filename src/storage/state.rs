//! Thin in-memory façade over configuration and the event history. The
//! controller talks to state only through this store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;

use crate::config::{Config, TaskConfig};
use crate::models::Event;
use crate::storage::EventStore;

pub struct StateStore {
    config: Mutex<Config>,
    events: EventStore,
}

impl StateStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: Mutex::new(config),
            events: EventStore::new(),
        }
    }

    fn lock_config(&self) -> MutexGuard<'_, Config> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_config(&self) -> Config {
        self.lock_config().clone()
    }

    pub fn task_configs(&self) -> Vec<TaskConfig> {
        self.lock_config().tasks.clone()
    }

    pub fn get_task(&self, name: &str) -> Option<TaskConfig> {
        self.lock_config().task(name).cloned()
    }

    /// Insert or replace a task's configuration.
    pub fn set_task(&self, task: TaskConfig) {
        let mut config = self.lock_config();
        match config.tasks.iter_mut().find(|t| t.name == task.name) {
            Some(existing) => *existing = task,
            None => config.tasks.push(task),
        }
    }

    pub fn delete_task(&self, name: &str) {
        self.lock_config().tasks.retain(|t| t.name != name);
    }

    pub fn add_task_event(&self, event: Event) -> Result<()> {
        self.events.add(event)
    }

    /// Events keyed by task name, newest first. An empty name returns the
    /// full snapshot.
    pub fn task_events(&self, task_name: &str) -> HashMap<String, Vec<Event>> {
        if task_name.is_empty() {
            return self.events.read_all();
        }
        let events = self.events.read(task_name);
        if events.is_empty() {
            return HashMap::new();
        }
        HashMap::from([(task_name.to_string(), events)])
    }

    pub fn delete_task_events(&self, task_name: &str) {
        self.events.delete(task_name);
    }
}
