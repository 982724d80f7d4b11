//! The controller owns the task set and multiplexes the two task kinds:
//! dynamic tasks triggered by template-change notifications from the
//! watcher, and scheduled tasks driven by per-task cron loops. Every apply
//! runs under the registry's active guard and records one event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::driver::{Driver, DriverFactory, Drivers};
use crate::engine::EngineError;
use crate::models::Event;
use crate::retry::{self, Retry};
use crate::storage::StateStore;
use crate::watcher::Watcher;

const DEFAULT_WATCHER_CHANNEL_CAPACITY: usize = 16;
const SCHEDULE_START_CHANNEL_CAPACITY: usize = 8;

/// How long the bootstrap sweep waits before re-rendering a template whose
/// inputs were not ready.
const ONCE_SETTLE_INTERVAL: Duration = Duration::from_millis(500);

/// Orchestrates task execution in bootstrap ("once") and daemon modes.
pub struct Controller {
    state: Arc<StateStore>,
    pub(crate) drivers: Arc<Drivers>,
    watcher: Arc<dyn Watcher>,
    factory: Arc<dyn DriverFactory>,
    retry: Retry,
    watcher_tx: mpsc::Sender<String>,
    watcher_rx: AsyncMutex<Option<mpsc::Receiver<String>>>,
    schedule_start_tx: mpsc::Sender<Arc<dyn Driver>>,
    schedule_start_rx: AsyncMutex<Option<mpsc::Receiver<Arc<dyn Driver>>>>,
    /// Stop signals for running scheduled-task loops, keyed by task name.
    pub(crate) schedule_stop_txs: AsyncMutex<HashMap<String, oneshot::Sender<()>>>,
    task_notify: Option<mpsc::UnboundedSender<String>>,
    once_settle: Duration,
}

impl Controller {
    pub fn new(config: Config, watcher: Arc<dyn Watcher>, factory: Arc<dyn DriverFactory>) -> Self {
        let retry = Retry::new(config.max_retries, config.retry_seed());
        let capacity = watcher.size().max(DEFAULT_WATCHER_CHANNEL_CAPACITY);
        let (watcher_tx, watcher_rx) = mpsc::channel(capacity);
        let (schedule_start_tx, schedule_start_rx) = mpsc::channel(SCHEDULE_START_CHANNEL_CAPACITY);

        Self {
            state: Arc::new(StateStore::new(config)),
            drivers: Arc::new(Drivers::new()),
            watcher,
            factory,
            retry,
            watcher_tx,
            watcher_rx: AsyncMutex::new(Some(watcher_rx)),
            schedule_start_tx,
            schedule_start_rx: AsyncMutex::new(Some(schedule_start_rx)),
            schedule_stop_txs: AsyncMutex::new(HashMap::new()),
            task_notify: None,
            once_settle: ONCE_SETTLE_INTERVAL,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn drivers(&self) -> &Drivers {
        &self.drivers
    }

    /// Sender used to hand a newly created scheduled task's driver to the
    /// dispatch loop.
    pub fn schedule_starter(&self) -> mpsc::Sender<Arc<dyn Driver>> {
        self.schedule_start_tx.clone()
    }

    /// Switch to nanosecond retry delays and report completed task names on
    /// the returned channel. Call before the controller is shared.
    pub fn enable_test_mode(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.task_notify = Some(tx);
        self.retry = Retry::test_mode(self.retry.max_retries());
        self.once_settle = Duration::from_millis(1);
        rx
    }

    /// Build and register a driver for every configured task. Fails fast on
    /// the first error; partially registered state is left for the caller.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        let config = self.state.get_config();
        info!(task_count = config.tasks.len(), "initializing tasks");
        for task_config in &config.tasks {
            let task = task_config.to_task();
            let name = task.name.clone();
            debug!(task_name = %name, "initializing task");
            let driver = self
                .factory
                .new_driver(&config, task)
                .await
                .with_context(|| format!("error creating driver for task '{name}'"))?;
            self.drivers.add(name.clone(), driver.clone())?;
            driver
                .init_task(cancel)
                .await
                .with_context(|| format!("error initializing task '{name}'"))?;
        }
        Ok(())
    }

    /// Daemon mode: start the watcher and the scheduled-task loops, then
    /// dispatch template notifications until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(
            template_count = self.watcher.size(),
            "starting controller in daemon mode"
        );
        let config = self.state.get_config();
        if config.buffer_period {
            self.drivers.set_buffer_period();
        }

        tokio::spawn(self.clone().run_watcher(cancel.child_token()));

        for (_, driver) in self.drivers.map() {
            if driver.task().is_scheduled() {
                self.clone().start_scheduled_task(&cancel, driver).await;
            }
        }

        let mut watcher_rx = self
            .watcher_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("controller run loop already started"))?;
        let mut schedule_start_rx = self
            .schedule_start_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("controller run loop already started"))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopping controller");
                    self.watcher.stop();
                    return Err(EngineError::Cancelled.into());
                }
                Some(template_id) = watcher_rx.recv() => {
                    debug!(template_id = %template_id, "template change notification");
                    match self.drivers.get_task_by_template(&template_id) {
                        Some((name, driver)) => {
                            let ctrl = self.clone();
                            let child = cancel.child_token();
                            tokio::spawn(async move {
                                if let Err(err) = ctrl.run_dynamic_task(&child, driver).await {
                                    error!(
                                        task_name = %name,
                                        error = %format!("{err:#}"),
                                        "dynamic task run failed"
                                    );
                                }
                            });
                        }
                        None => {
                            warn!(template_id = %template_id, "no dynamic task watches this template");
                        }
                    }
                }
                Some(driver) = schedule_start_rx.recv() => {
                    self.clone().start_scheduled_task(&cancel, driver).await;
                }
            }
        }
    }

    /// Keep the watcher running, reconnecting with backoff when it fails.
    async fn run_watcher(self: Arc<Self>, cancel: CancellationToken) {
        let config = self.state.get_config();
        let watcher_retry = WatcherRetry::new(config.max_retries, config.retry_seed());
        let mut attempt: u32 = 0;
        loop {
            match self.watcher.watch(&cancel, self.watcher_tx.clone()).await {
                Ok(()) => {
                    debug!("watcher finished");
                    return;
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    attempt += 1;
                    let (again, wait) = watcher_retry.next_attempt(attempt);
                    if !again {
                        error!(
                            error = %format!("{err:#}"),
                            "watcher failed and reconnect retries are exhausted"
                        );
                        return;
                    }
                    warn!(
                        attempt_number = attempt,
                        error = %format!("{err:#}"),
                        "watcher failed, reconnecting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Register a stop channel for a scheduled task and start its loop.
    pub(crate) async fn start_scheduled_task(
        self: Arc<Self>,
        cancel: &CancellationToken,
        driver: Arc<dyn Driver>,
    ) {
        let name = driver.task().name;
        let (stop_tx, stop_rx) = oneshot::channel();
        self.schedule_stop_txs
            .lock()
            .await
            .insert(name.clone(), stop_tx);
        info!(task_name = %name, "starting scheduled task");
        let child = cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = self.run_scheduled_task(&child, driver, stop_rx).await {
                if err.downcast_ref::<EngineError>() == Some(&EngineError::Cancelled) {
                    debug!(task_name = %name, "scheduled task cancelled");
                } else {
                    error!(
                        task_name = %name,
                        error = %format!("{err:#}"),
                        "scheduled task failed"
                    );
                }
            }
        });
    }

    /// Bootstrap sweep: run every registered task until it has succeeded
    /// once or failed hard. Tasks run in sorted-name order.
    pub async fn once_consecutive(&self, cancel: &CancellationToken) -> Result<()> {
        info!(
            task_count = self.drivers.len(),
            "running tasks once before daemon mode"
        );
        for name in self.drivers.task_names() {
            let Some(driver) = self.drivers.get(&name) else {
                continue;
            };
            let task = driver.task();
            if !task.enabled {
                debug!(task_name = %name, "skipping disabled task");
                continue;
            }
            let scheduled = task.is_scheduled();
            loop {
                let rendered = self.check_apply(cancel, driver.clone(), true, true).await?;
                if rendered || scheduled {
                    break;
                }
                // Inputs not ready yet; give the watcher time to deliver
                // them before re-rendering.
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled.into()),
                    _ = tokio::time::sleep(self.once_settle) => {}
                }
            }
        }
        info!("all tasks completed once");
        Ok(())
    }

    /// One render+apply attempt with event bookkeeping.
    ///
    /// Returns whether the template rendered. `retry` wraps the apply in
    /// the backoff handler; `once` marks the bootstrap sweep, where a
    /// scheduled task whose template is not ready records no event.
    pub(crate) async fn check_apply(
        &self,
        cancel: &CancellationToken,
        driver: Arc<dyn Driver>,
        retry: bool,
        once: bool,
    ) -> Result<bool> {
        let task = driver.task();
        if !task.enabled {
            debug!(task_name = %task.name, "skipping disabled task");
            return Ok(false);
        }
        let name = task.name.clone();
        if name.is_empty() {
            return Err(anyhow!("error creating new event: task name is required"));
        }

        let event = Event::begin(&name);
        let rendered = match driver.render_template(cancel).await {
            Ok(rendered) => rendered,
            Err(err) => {
                let err = err.context(format!("error rendering template for task '{name}'"));
                if let Err(store_err) = self.state.add_task_event(event.end(Some(&err))) {
                    error!(task_name = %name, error = %store_err, "unable to store event");
                }
                return Err(err);
            }
        };

        if !rendered {
            if once && task.is_scheduled() {
                // The template resolves on the task's own tick; recording a
                // bootstrap event for absent inputs would be misleading.
                debug!(task_name = %name, "template not ready for scheduled task in once mode");
                return Ok(false);
            }
            debug!(task_name = %name, "template was not re-rendered");
            self.state.add_task_event(event.end(None))?;
            return Ok(false);
        }

        info!(task_name = %name, "executing task");
        let desc = format!("apply task '{name}'");
        let apply_result = if retry {
            self.retry
                .run(cancel, || driver.apply_task(cancel), &desc)
                .await
        } else {
            driver.apply_task(cancel).await
        };

        match apply_result {
            Ok(()) => {
                self.state.add_task_event(event.end(None))?;
                info!(task_name = %name, "task completed successfully");
                self.notify_completion(&name);
                Ok(true)
            }
            Err(err) => {
                let err = err.context(format!("could not apply changes for task '{name}'"));
                if let Err(store_err) = self.state.add_task_event(event.end(Some(&err))) {
                    error!(task_name = %name, error = %store_err, "unable to store event");
                }
                self.notify_completion(&name);
                Err(err)
            }
        }
    }

    /// Run a dynamic task under the active guard. A notification that
    /// arrives while the task is executing queues its run behind the guard
    /// and proceeds once the in-flight execution releases it.
    pub(crate) async fn run_dynamic_task(
        &self,
        cancel: &CancellationToken,
        driver: Arc<dyn Driver>,
    ) -> Result<()> {
        let task = driver.task();
        if task.is_scheduled() {
            debug!(task_name = %task.name, "ignoring template notification for scheduled task");
            return Ok(());
        }
        let name = task.name;
        // Several notifications can park here at once; a waiter that loses
        // the claim after a release goes back to waiting.
        loop {
            self.drivers.wait_for_inactive(cancel, &name).await?;
            if self.drivers.set_active(&name) {
                break;
            }
        }
        let result = self.check_apply(cancel, driver, true, false).await;
        self.drivers.set_inactive(&name);
        result.map(|_| ())
    }

    /// Remove a task after waiting for any in-flight execution to finish.
    /// Unknown names are a no-op.
    pub async fn delete_task(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let Some(driver) = self.drivers.get(name) else {
            debug!(task_name = %name, "task does not exist, nothing to delete");
            return Ok(());
        };

        self.drivers.wait_for_inactive(cancel, name).await?;

        if driver.task().is_scheduled() {
            if let Some(stop_tx) = self.schedule_stop_txs.lock().await.remove(name) {
                let _ = stop_tx.send(());
            }
        }

        driver.destroy_task(cancel).await;
        self.drivers.remove(name);
        self.state.delete_task_events(name);
        self.state.delete_task(name);
        info!(task_name = %name, "task deleted");
        Ok(())
    }

    fn notify_completion(&self, name: &str) {
        if let Some(tx) = &self.task_notify {
            let _ = tx.send(name.to_string());
        }
    }
}

/// Reconnect policy for the watcher loop. Separate from [`Retry`] because
/// the attempt counter survives across watch sessions and the caller owns
/// the sleep.
pub(crate) struct WatcherRetry {
    max_retries: i64,
    random: Mutex<StdRng>,
    wait_fn: fn(u32, &mut StdRng) -> Duration,
}

impl WatcherRetry {
    pub(crate) fn new(max_retries: i64, seed: u64) -> Self {
        Self {
            max_retries,
            random: Mutex::new(StdRng::seed_from_u64(seed)),
            wait_fn: retry::wait_time::<StdRng>,
        }
    }

    /// Whether attempt number `attempt` is allowed, and how long to wait
    /// before it. `max_retries` of -1 never refuses.
    pub(crate) fn next_attempt(&self, attempt: u32) -> (bool, Duration) {
        if self.max_retries >= 0 && i64::from(attempt) > self.max_retries {
            return (false, Duration::ZERO);
        }
        let mut random = match self.random.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (true, (self.wait_fn)(attempt, &mut random))
    }
}
