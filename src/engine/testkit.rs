//! Hand-rolled collaborators for engine tests: a scriptable driver, a
//! watcher that idles until cancelled, and a factory that records what it
//! builds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::driver::{Driver, DriverFactory};
use crate::models::Task;
use crate::watcher::Watcher;

/// Driver whose render/apply outcomes are scripted per call. Unscripted
/// calls render `true` and apply successfully.
pub(crate) struct MockDriver {
    task: Task,
    render_script: Mutex<VecDeque<Result<bool, String>>>,
    apply_script: Mutex<VecDeque<Option<String>>>,
    apply_always_fails: Mutex<Option<String>>,
    render_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    init_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl MockDriver {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            render_script: Mutex::new(VecDeque::new()),
            apply_script: Mutex::new(VecDeque::new()),
            apply_always_fails: Mutex::new(None),
            render_calls: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    /// Queue render outcomes: `Ok(bool)` for a result, `Err(msg)` for a
    /// failure.
    pub fn script_renders(self, results: Vec<Result<bool, String>>) -> Self {
        *self.render_script.lock().unwrap() = results.into();
        self
    }

    /// Queue apply outcomes: `Some(msg)` fails with that error, `None`
    /// succeeds.
    pub fn script_applies(self, results: Vec<Option<String>>) -> Self {
        *self.apply_script.lock().unwrap() = results.into();
        self
    }

    /// Every apply fails with the given message, regardless of scripts.
    pub fn always_fail_apply(self, message: &str) -> Self {
        *self.apply_always_fails.lock().unwrap() = Some(message.to_string());
        self
    }

    pub fn render_call_count(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub fn apply_call_count(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn init_call_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_call_count(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn task(&self) -> Task {
        self.task.clone()
    }

    fn template_ids(&self) -> Vec<String> {
        self.task.template_ids().to_vec()
    }

    async fn init_task(&self, _cancel: &CancellationToken) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn render_template(&self, _cancel: &CancellationToken) -> Result<bool> {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        match self.render_script.lock().unwrap().pop_front() {
            Some(Ok(rendered)) => Ok(rendered),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(true),
        }
    }

    async fn apply_task(&self, _cancel: &CancellationToken) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.apply_always_fails.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        match self.apply_script.lock().unwrap().pop_front() {
            Some(Some(message)) => Err(anyhow!(message)),
            _ => Ok(()),
        }
    }

    async fn destroy_task(&self, _cancel: &CancellationToken) {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn set_buffer_period(&self) {}
}

/// Watcher that streams nothing and returns when cancelled.
pub(crate) struct MockWatcher {
    size: usize,
    stop_calls: AtomicUsize,
}

impl MockWatcher {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            stop_calls: AtomicUsize::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn stop_call_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Watcher for MockWatcher {
    async fn watch(&self, cancel: &CancellationToken, _events: mpsc::Sender<String>) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory that builds a [`MockDriver`] per task and keeps every driver it
/// created for later assertions.
pub(crate) struct MockFactory {
    build: Box<dyn Fn(&Task) -> MockDriver + Send + Sync>,
    created: Mutex<Vec<Arc<MockDriver>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::with(|task| MockDriver::new(task.clone()))
    }

    pub fn with(build: impl Fn(&Task) -> MockDriver + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<Arc<MockDriver>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriverFactory for MockFactory {
    async fn new_driver(&self, _config: &Config, task: Task) -> Result<Arc<dyn Driver>> {
        let driver = Arc::new((self.build)(&task));
        self.created.lock().unwrap().push(driver.clone());
        Ok(driver)
    }
}
