use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, TaskDescriptor, TaskId};
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One firing of a recurring schedule.
#[derive(Debug, Clone)]
pub struct Occurrence {
    /// Fired descriptor. The first occurrence is the original task itself;
    /// later ones are fresh tasks created with [`TaskDescriptor::recur`].
    pub descriptor: TaskDescriptor,
    /// Whether this is the template's own first firing.
    pub first: bool,
}

/// Cron-driven recurring submissions.
///
/// Every descriptor carrying a `cron_expression` gets a timer task that
/// sleeps until the next fire time and sends an [`Occurrence`] to the
/// receiver returned by [`CronScheduler::new`]. Schedules are keyed by the
/// task id of the original descriptor.
pub struct CronScheduler {
    jobs: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    tx: mpsc::UnboundedSender<Occurrence>,
}

impl CronScheduler {
    /// A scheduler and the receiver its occurrences arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Occurrence>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs: Mutex::new(HashMap::new()),
                tx,
            },
            rx,
        )
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    ///
    /// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
    pub fn parse_cron(cron_expr: &str) -> ConductorResult<Schedule> {
        Schedule::from_str(cron_expr)
            .map_err(|e| ConductorError::InvalidCron(format!("'{cron_expr}': {e}")))
    }

    /// First fire time after now.
    pub fn next_fire_time(cron_expr: &str) -> ConductorResult<DateTime<Utc>> {
        let schedule = Self::parse_cron(cron_expr)?;
        schedule.upcoming(Utc).next().ok_or_else(|| {
            ConductorError::InvalidCron(format!("'{cron_expr}' has no upcoming fire times"))
        })
    }

    /// Arm a schedule for `template`. With `first_pending`, the first fire
    /// dispatches the template task itself; otherwise every fire is a
    /// recurrence.
    pub fn schedule(&self, template: TaskDescriptor, first_pending: bool) -> ConductorResult<()> {
        let expr = template.options.cron_expression.clone().ok_or_else(|| {
            ConductorError::InvalidCron(format!("task {} has no cron expression", template.task_id))
        })?;
        let schedule = Self::parse_cron(&expr)?;
        let schedule_id = template.task_id;

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&schedule_id) {
            return Ok(());
        }
        let tx = self.tx.clone();
        let job = tokio::spawn(async move {
            let mut first = first_pending;
            for fire_at in schedule.upcoming(Utc) {
                let wait = (fire_at - Utc::now()).to_std().unwrap_or_default();
                debug!(schedule_id = %schedule_id, wait_ms = wait.as_millis() as u64, "Waiting for next fire");
                tokio::time::sleep(wait).await;

                let descriptor = if first {
                    template.clone()
                } else {
                    template.recur()
                };
                info!(schedule_id = %schedule_id, task_id = %descriptor.task_id, "Schedule fired");
                if tx.send(Occurrence { descriptor, first }).is_err() {
                    break;
                }
                first = false;
            }
            warn!(schedule_id = %schedule_id, "Schedule has no further fire times");
        });
        jobs.insert(schedule_id, job);
        info!(schedule_id = %schedule_id, cron = %expr, "Schedule armed");
        Ok(())
    }

    /// Stop a schedule. Returns `false` when none was armed under that id.
    pub fn cancel(&self, schedule_id: TaskId) -> bool {
        match self.jobs.lock().remove(&schedule_id) {
            Some(job) => {
                job.abort();
                info!(schedule_id = %schedule_id, "Schedule cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a schedule is armed.
    pub fn is_scheduled(&self, schedule_id: TaskId) -> bool {
        self.jobs.lock().contains_key(&schedule_id)
    }

    /// Number of armed schedules.
    pub fn schedule_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Disarm every schedule.
    pub fn shutdown(&self) {
        for (_, job) in self.jobs.lock().drain() {
            job.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::{TaskClass, TaskOptions};
    use serde_json::json;
    use std::time::Duration;

    fn template(expr: &str) -> TaskDescriptor {
        TaskDescriptor::new(
            "reporter",
            TaskClass::Simple,
            json!({"report": "daily"}),
            TaskOptions::default().with_cron(expr),
        )
    }

    #[test]
    fn test_parse_valid_cron() {
        assert!(CronScheduler::parse_cron("0 * * * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron() {
        let err = CronScheduler::parse_cron("not a cron expression").unwrap_err();
        assert!(matches!(err, ConductorError::InvalidCron(_)));
    }

    #[test]
    fn test_next_fire_time_is_future() {
        let next = CronScheduler::next_fire_time("0 * * * * * *").unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn test_fires_template_then_recurrences() {
        let (scheduler, mut rx) = CronScheduler::new();
        let t = template("* * * * * * *");
        scheduler.schedule(t.clone(), true).unwrap();
        assert!(scheduler.is_scheduled(t.task_id));

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.first);
        assert_eq!(first.descriptor.task_id, t.task_id);

        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!second.first);
        assert_ne!(second.descriptor.task_id, t.task_id);
        assert_eq!(second.descriptor.schedule_id, Some(t.task_id));

        assert!(scheduler.cancel(t.task_id));
        assert!(!scheduler.cancel(t.task_id));
        assert_eq!(scheduler.schedule_count(), 0);
    }

    #[test]
    fn test_schedule_requires_cron() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (scheduler, _rx) = CronScheduler::new();
            let mut t = template("0 * * * * * *");
            t.options.cron_expression = None;
            assert!(scheduler.schedule(t, true).is_err());
        });
    }
}
