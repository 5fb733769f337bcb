//! Minimal cron-driven job runner for periodic maintenance work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid cron expression for job {job}: {reason}")]
    InvalidSchedule { job: String, reason: String },
    #[error("Job already registered: {0}")]
    Duplicate(String),
    #[error("Scheduler already running")]
    AlreadyRunning,
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Six-field cron expression (with seconds), e.g. `0 */15 * * * *`.
    fn schedule(&self) -> &str;

    async fn execute(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub is_active: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Registered {
    job: Arc<dyn Job>,
    schedule: Schedule,
}

pub struct JobScheduler {
    jobs: RwLock<Vec<Registered>>,
    status: Arc<RwLock<HashMap<String, JobStatus>>>,
    shutdown: watch::Sender<bool>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: RwLock::new(Vec::new()),
            status: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            tasks: RwLock::new(Vec::new()),
        }
    }

    pub async fn register_job(&self, job: Box<dyn Job>) -> Result<(), SchedulerError> {
        let name = job.name().to_string();
        let schedule = Schedule::from_str(job.schedule()).map_err(|e| SchedulerError::InvalidSchedule {
            job: name.clone(),
            reason: e.to_string(),
        })?;

        let mut status = self.status.write().await;
        if status.contains_key(&name) {
            return Err(SchedulerError::Duplicate(name));
        }
        status.insert(name.clone(), JobStatus::default());
        self.jobs.write().await.push(Registered {
            job: Arc::from(job),
            schedule,
        });
        info!(job = %name, "Job registered");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        if !tasks.is_empty() {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.shutdown.send_replace(false);

        for registered in self.jobs.read().await.iter() {
            let job = registered.job.clone();
            let schedule = registered.schedule.clone();
            let status = self.status.clone();
            let mut shutdown = self.shutdown.subscribe();

            tasks.push(tokio::spawn(async move {
                let name = job.name().to_string();
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        warn!(job = %name, "Schedule has no upcoming runs");
                        break;
                    };
                    set_status(&status, &name, |s| {
                        s.is_active = true;
                        s.next_run = Some(next);
                    })
                    .await;

                    let wait = (next - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => break,
                    }

                    let result = job.execute().await;
                    let error = result.err().map(|e| e.to_string());
                    if let Some(e) = &error {
                        error!(job = %name, "Job failed: {}", e);
                    }
                    set_status(&status, &name, |s| {
                        s.last_run = Some(Utc::now());
                        s.last_error = error;
                    })
                    .await;
                }
                set_status(&status, &name, |s| {
                    s.is_active = false;
                    s.next_run = None;
                })
                .await;
            }));
        }

        // Report every job active with its first run before returning.
        for registered in self.jobs.read().await.iter() {
            let next = registered.schedule.upcoming(Utc).next();
            set_status(&self.status, registered.job.name(), |s| {
                s.is_active = true;
                s.next_run = next;
            })
            .await;
        }

        info!(jobs = tasks.len(), "Scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks.write().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }

    pub async fn get_job_status(&self) -> HashMap<String, JobStatus> {
        self.status.read().await.clone()
    }
}

async fn set_status<F>(status: &RwLock<HashMap<String, JobStatus>>, name: &str, update: F)
where
    F: FnOnce(&mut JobStatus),
{
    if let Some(entry) = status.write().await.get_mut(name) {
        update(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn schedule(&self) -> &str {
            "not a cron"
        }

        async fn execute(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let scheduler = JobScheduler::new();
        let err = scheduler.register_job(Box::new(Noop)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
        assert!(scheduler.get_job_status().await.is_empty());
    }
}
