//! Per-task loops for cron-scheduled tasks. Each loop computes its next
//! fire time directly from the cron expression and waits on the earliest
//! of the tick, cancellation, or the task's stop signal.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use cron::Schedule;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::Driver;
use crate::engine::controller::Controller;
use crate::engine::EngineError;
use crate::models::Condition;

/// Parse a cron expression. Standard 5-field expressions are accepted by
/// prepending a seconds field.
pub(crate) fn parse_schedule(expression: &str) -> Result<Schedule> {
    let normalized = expression.trim();
    if normalized.split_whitespace().count() == 5 {
        if let Ok(schedule) = Schedule::from_str(&format!("0 {normalized}")) {
            return Ok(schedule);
        }
    }
    Schedule::from_str(normalized)
        .map_err(|err| anyhow!("invalid cron expression '{normalized}': {err}"))
}

impl Controller {
    /// Drive one scheduled task until it is stopped, deleted, or cancelled.
    ///
    /// Apply failures are logged and the loop continues; retries already
    /// happened inside `check_apply`.
    pub(crate) async fn run_scheduled_task(
        &self,
        cancel: &CancellationToken,
        driver: Arc<dyn Driver>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        let task = driver.task();
        let name = task.name.clone();
        let Condition::Scheduled { cron } = &task.condition else {
            return Err(EngineError::NotScheduled(name).into());
        };
        let schedule = parse_schedule(cron)
            .with_context(|| format!("unable to schedule task '{name}'"))?;
        info!(task_name = %name, cron = %cron, "scheduled task loop started");

        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                warn!(task_name = %name, "cron schedule has no upcoming fire time");
                return Ok(());
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(task_name = %name, next_fire = %next, "waiting for next scheduled run");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(task_name = %name, "stopping scheduled task");
                    return Err(EngineError::Cancelled.into());
                }
                _ = &mut stop_rx => {
                    info!(task_name = %name, "scheduled task stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if self.drivers.get(&name).is_none() {
                debug!(task_name = %name, "scheduled task no longer registered, exiting loop");
                self.schedule_stop_txs.lock().await.remove(&name);
                return Ok(());
            }

            self.drivers.wait_for_inactive(cancel, &name).await?;
            self.drivers.set_active(&name);
            let result = self.check_apply(cancel, driver.clone(), true, false).await;
            self.drivers.set_inactive(&name);
            if let Err(err) = result {
                error!(
                    task_name = %name,
                    error = %format!("{err:#}"),
                    "scheduled task run failed"
                );
            }
        }
    }
}
