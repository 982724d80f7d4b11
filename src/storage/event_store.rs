//! In-memory, per-task bounded history of execution events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::models::Event;

/// Events kept per task before the oldest is evicted.
pub const DEFAULT_EVENT_CAPACITY: usize = 5;

/// Bounded ring of events per task. Reads hand out defensive copies.
pub struct EventStore {
    events: Mutex<HashMap<String, VecDeque<Event>>>,
    capacity: usize,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Event>>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append an event, evicting the oldest entry once the task's ring is
    /// full.
    pub fn add(&self, event: Event) -> Result<()> {
        if event.task_name.is_empty() {
            return Err(anyhow!("error adding event: task name is required"));
        }
        let mut events = self.lock();
        let ring = events
            .entry(event.task_name.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        ring.push_back(event);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        Ok(())
    }

    /// Events for one task, newest first.
    pub fn read(&self, task_name: &str) -> Vec<Event> {
        self.lock()
            .get(task_name)
            .map(|ring| ring.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every task's events, newest first per task.
    pub fn read_all(&self) -> HashMap<String, Vec<Event>> {
        self.lock()
            .iter()
            .map(|(name, ring)| (name.clone(), ring.iter().rev().cloned().collect()))
            .collect()
    }

    pub fn count(&self, task_name: &str) -> usize {
        self.lock().get(task_name).map_or(0, VecDeque::len)
    }

    /// Drop the entire ring for a task.
    pub fn delete(&self, task_name: &str) {
        self.lock().remove(task_name);
    }
}
