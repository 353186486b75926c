//! Bounded concurrent batch execution
//!
//! Jobs run on a `JoinSet`, at most `workers` at a time. The cancellation
//! token is checked after a job gets its permit and before it starts; jobs
//! not yet started when cancellation arrives are reported as cancelled.
//! A failing or panicking job never affects its siblings.

use super::cancel::CancellationToken;
use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_WORKERS: usize = 2;

/// Result of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    Completed { job_id: String, output: T },
    Failed { job_id: String, error: String },
    Cancelled { job_id: String },
}

impl<T> JobOutcome<T> {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } | Self::Cancelled { job_id } => {
                job_id
            }
        }
    }

    pub fn output(&self) -> Option<&T> {
        match self {
            Self::Completed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Outcomes of a batch run, in job submission order.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<JobOutcome<T>>,
}

impl<T> BatchReport<T> {
    pub fn completed(&self) -> impl Iterator<Item = &T> {
        self.outcomes.iter().filter_map(JobOutcome::output)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Failed { .. }))
            .count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Cancelled { .. }))
            .count()
    }
}

pub struct BatchRunner {
    workers: usize,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `work` over every `(job_id, job)` pair.
    pub async fn run<J, T, E, F, Fut>(&self, jobs: Vec<(String, J)>, work: F) -> BatchReport<T>
    where
        J: Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = jobs.len();
        info!(%run_id, jobs = total, workers = self.workers, "starting batch");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let work = Arc::new(work);
        let mut join_set = JoinSet::new();
        let mut job_ids = Vec::with_capacity(total);

        for (position, (job_id, job)) in jobs.into_iter().enumerate() {
            job_ids.push(job_id.clone());
            let semaphore = Arc::clone(&semaphore);
            let work = Arc::clone(&work);
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Err(e) => JobOutcome::Failed {
                        job_id,
                        error: format!("worker pool closed: {}", e),
                    },
                    Ok(_permit) if cancel.is_cancelled() => {
                        debug!(%job_id, "skipping job after cancellation");
                        JobOutcome::Cancelled { job_id }
                    }
                    Ok(_permit) => match (*work)(job).await {
                        Ok(output) => JobOutcome::Completed { job_id, output },
                        Err(e) => {
                            warn!(%job_id, error = %e, "batch job failed");
                            JobOutcome::Failed {
                                job_id,
                                error: e.to_string(),
                            }
                        }
                    },
                };
                (position, outcome)
            });
        }

        let mut slots: Vec<Option<JobOutcome<T>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((position, outcome)) => slots[position] = Some(outcome),
                Err(e) => warn!(%run_id, error = %e, "batch task panicked"),
            }
        }

        let outcomes: Vec<JobOutcome<T>> = slots
            .into_iter()
            .zip(job_ids)
            .map(|(slot, job_id)| {
                slot.unwrap_or_else(|| JobOutcome::Failed {
                    job_id,
                    error: "job panicked".to_string(),
                })
            })
            .collect();

        let report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            %run_id,
            completed = report.completed().count(),
            failed = report.failed_count(),
            cancelled = report.cancelled_count(),
            "batch finished"
        );
        report
    }
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn jobs(n: usize) -> Vec<(String, usize)> {
        (0..n).map(|i| (format!("job-{i}"), i)).collect()
    }

    #[tokio::test]
    async fn failures_are_isolated_and_order_is_kept() {
        let report = BatchRunner::new(3)
            .run(jobs(5), |i| async move {
                if i == 2 {
                    Err(format!("job {i} broke"))
                } else {
                    Ok(i * 10)
                }
            })
            .await;

        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.outcomes[2].job_id(), "job-2");
        assert_eq!(report.completed().copied().collect::<Vec<_>>(), vec![0, 10, 30, 40]);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_workers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        BatchRunner::new(2)
            .run(jobs(6), move |_| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancellation_stops_jobs_not_yet_started() {
        let runner = BatchRunner::new(1);
        let cancel = runner.cancellation().clone();

        let report = runner
            .run(jobs(4), move |i| {
                let cancel = cancel.clone();
                async move {
                    if i == 0 {
                        cancel.cancel();
                    }
                    Ok::<_, String>(i)
                }
            })
            .await;

        assert_eq!(report.completed().count(), 1);
        assert_eq!(report.cancelled_count(), 3);
    }
}
