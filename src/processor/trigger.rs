use crate::cache::{job_lock_key, wait_until_free, SharedRunLock};
use crate::config::PipelineConfig;
use crate::processor::cron::parse_timezone;
use crate::processor::executor::Executor;
use crate::processor::jobs::{find_job, JobDefinition, DAILY_JOB, WEEKLY_JOB};
use crate::processor::job::{RunContext, RunSummary};
use crate::utils::log_utils::{append_run_summary, log_run_summary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

const DAILY_LOCK_POLL: Duration = Duration::from_secs(30);

/// Fires the configured jobs on their cron schedules. Each job run holds
/// `job:<name>` so a job never overlaps itself.
pub struct Trigger {
    executor: Executor,
    jobs: Vec<JobDefinition>,
    tz: Tz,
    lock: SharedRunLock,
    lock_ttl: Duration,
    weekly_wait: Duration,
    run_log: PathBuf,
}

impl Trigger {
    pub fn new(
        executor: Executor,
        jobs: Vec<JobDefinition>,
        lock: SharedRunLock,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let tz = parse_timezone(&config.schedule.timezone)?;
        for job in &jobs {
            executor
                .graph()
                .execution_order(&job.nodes)
                .with_context(|| format!("Job {} references unknown nodes", job.name))?;
        }
        Ok(Self {
            executor,
            jobs,
            tz,
            lock,
            lock_ttl: Duration::from_secs(config.redis.lock_ttl_secs),
            weekly_wait: Duration::from_secs(config.scheduler.weekly_wait_for_daily_secs),
            run_log: PathBuf::from(&config.logs.run_log_path),
        })
    }

    pub fn jobs(&self) -> &[JobDefinition] {
        &self.jobs
    }

    /// Today's date in the scheduler timezone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    /// Next fire time per job, soonest first.
    pub fn upcoming(&self, now: DateTime<Utc>) -> Vec<(&JobDefinition, DateTime<Tz>)> {
        let mut fires: Vec<_> = self
            .jobs
            .iter()
            .filter_map(|job| job.schedule.next_fire(&now, self.tz).map(|at| (job, at)))
            .collect();
        fires.sort_by_key(|(_, at)| *at);
        fires
    }

    /// The earliest fire instant after both `now` and `last_fired`, with the
    /// names of every job due at it.
    pub fn next_due(
        &self,
        now: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> Option<(DateTime<Tz>, Vec<String>)> {
        let from = last_fired.map_or(now, |last| last.max(now));
        let upcoming = self.upcoming(from);
        let at = upcoming.first()?.1;
        let due = upcoming
            .iter()
            .filter(|(_, t)| *t == at)
            .map(|(job, _)| job.name.clone())
            .collect();
        Some((at, due))
    }

    /// Runs one job for `run_date`. Returns `None` when the job is already
    /// running elsewhere.
    #[instrument(skip(self, shutdown))]
    pub async fn run_job(
        &self,
        name: &str,
        run_date: NaiveDate,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Option<RunSummary>> {
        let job = find_job(&self.jobs, name)?;

        if job.name == WEEKLY_JOB {
            let daily_key = job_lock_key(DAILY_JOB);
            let poll = DAILY_LOCK_POLL.min(self.weekly_wait.max(Duration::from_millis(1)));
            if !wait_until_free(self.lock.as_ref(), &daily_key, self.weekly_wait, poll).await? {
                warn!(
                    "Daily run still in flight after {:?} - starting weekly job anyway",
                    self.weekly_wait
                );
            }
        }

        let key = job_lock_key(&job.name);
        let Some(token) = self.lock.try_acquire(&key, self.lock_ttl).await? else {
            warn!("Job {} is already running - skipping this trigger", job.name);
            return Ok(None);
        };

        info!("Starting job {} ({}) for {}", job.name, job.description, run_date);
        let ctx = RunContext::new(&job.name, run_date, shutdown);
        let outcome = self.executor.run(&job.nodes, &ctx).await;

        if let Err(e) = self.lock.release(&token).await {
            warn!("Failed to release {}: {}", key, e);
        }
        let summary = outcome?;

        log_run_summary(&summary);
        if let Err(e) = append_run_summary(&self.run_log, &summary) {
            error!("Failed to append run summary: {:#}", e);
        }
        Ok(Some(summary))
    }

    /// Sleeps until the next fire, launches every job due at that instant,
    /// and repeats until `shutdown` flips. In-flight runs are awaited before
    /// returning; they see the same shutdown signal and skip remaining nodes.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        // The sleep runs on the monotonic clock; the wall clock may still be
        // short of `at` when it ends.
        let mut last_fired: Option<DateTime<Utc>> = None;

        loop {
            let now = Utc::now();
            let Some((at, due)) = self.next_due(now, last_fired) else {
                anyhow::bail!("no job has a future fire time");
            };
            info!("Next run: {} at {}", due.join(", "), at);

            let wait = (at.with_timezone(&Utc) - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Job task ended abnormally: {}", e);
                    }
                    continue;
                }
            }

            last_fired = Some(at.with_timezone(&Utc));
            let run_date = at.date_naive();
            for name in due {
                let trigger = Arc::clone(&self);
                let rx = shutdown.clone();
                in_flight.spawn(async move {
                    match trigger.run_job(&name, run_date, rx).await {
                        Ok(Some(summary)) if !summary.is_clean() => {
                            warn!("Job {} finished with {} failed nodes", name, summary.failed)
                        }
                        Ok(_) => {}
                        Err(e) => error!("Job {} failed: {:#}", name, e),
                    }
                });
            }
        }

        info!("Scheduler stopping - waiting for {} in-flight runs", in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Job task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LocalRunLock, RunLock};
    use crate::processor::executor::ExecutorConfig;
    use crate::processor::job::NodeStatus;
    use crate::processor::jobs::standard_jobs;
    use crate::processor::pipeline::{build_graph, PipelineDeps, WEEKLY_PORTFOLIO_RECOMMENDATION};
    use crate::test_support::{fake_deps, trading_day};
    use chrono::TimeZone;

    fn trigger(deps: &PipelineDeps, log_name: &str) -> (Trigger, PathBuf) {
        let mut config = PipelineConfig::default();
        let log = std::env::temp_dir().join(format!("{}-{}.jsonl", log_name, uuid::Uuid::new_v4()));
        config.logs.run_log_path = log.display().to_string();
        config.scheduler.weekly_wait_for_daily_secs = 120;
        let graph = Arc::new(build_graph(&config, deps).unwrap());
        let executor = Executor::new(graph, ExecutorConfig::from(&config.scheduler));
        let jobs = standard_jobs(&config.schedule).unwrap();
        (Trigger::new(executor, jobs, deps.lock.clone(), &config).unwrap(), log)
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn weekly_run_is_logged_and_releases_its_lock() {
        let deps = fake_deps();
        let (trigger, log) = trigger(&deps, "weekly");

        let summary = trigger
            .run_job(WEEKLY_JOB, trading_day(), no_shutdown())
            .await
            .unwrap()
            .unwrap();
        // Nothing upstream has run yet, so there is no macro summary.
        let node = summary.node(WEEKLY_PORTFOLIO_RECOMMENDATION).unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.error_kind.as_deref(), Some("precondition_missing"));

        assert!(!deps.lock.is_held(&job_lock_key(WEEKLY_JOB)).await.unwrap());
        let logged = std::fs::read_to_string(&log).unwrap();
        assert_eq!(logged.lines().count(), 1);
        assert!(logged.contains("weekly_portfolio_job"));
        let _ = std::fs::remove_file(log);
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let deps = fake_deps();
        let (trigger, _) = trigger(&deps, "overlap");
        let held = deps
            .lock
            .try_acquire(&job_lock_key(DAILY_JOB), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let outcome = trigger.run_job(DAILY_JOB, trading_day(), no_shutdown()).await.unwrap();
        assert!(outcome.is_none());
        deps.lock.release(&held).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn weekly_waits_for_the_daily_lock() {
        let lock = Arc::new(LocalRunLock::new());
        let deps = PipelineDeps {
            lock: lock.clone(),
            ..fake_deps()
        };
        let (trigger, log) = trigger(&deps, "wait");
        let held = lock
            .try_acquire(&job_lock_key(DAILY_JOB), Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();

        let releaser = {
            let lock = lock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(45)).await;
                lock.release(&held).await.unwrap();
            })
        };
        let started = tokio::time::Instant::now();
        let summary = trigger.run_job(WEEKLY_JOB, trading_day(), no_shutdown()).await.unwrap();
        assert!(summary.is_some());
        assert!(started.elapsed() >= Duration::from_secs(45));
        releaser.await.unwrap();
        let _ = std::fs::remove_file(log);
    }

    #[test]
    fn upcoming_is_sorted() {
        let deps = fake_deps();
        let (trigger, _) = trigger(&deps, "upcoming");
        // Sunday evening UTC: Monday 02:15 and 04:15 at GMT+2 are both next.
        let now = Utc.with_ymd_and_hms(2024, 5, 5, 20, 0, 0).unwrap();
        let fires = trigger.upcoming(now);
        assert_eq!(fires[0].0.name, DAILY_JOB);
        assert_eq!(fires[1].0.name, WEEKLY_JOB);
        assert_eq!(fires[0].1.with_timezone(&Utc), Utc.with_ymd_and_hms(2024, 5, 6, 0, 15, 0).unwrap());
        assert_eq!(fires[1].1.with_timezone(&Utc), Utc.with_ymd_and_hms(2024, 5, 6, 2, 15, 0).unwrap());
    }

    #[test]
    fn fired_instant_is_never_due_again() {
        let deps = fake_deps();
        let (trigger, _) = trigger(&deps, "next-due");
        let utc = |d, h, m, s| Utc.with_ymd_and_hms(2024, 5, d, h, m, s).unwrap();
        // One second before Monday's daily fire.
        let now = utc(6, 0, 14, 59);

        let (at, due) = trigger.next_due(now, None).unwrap();
        assert_eq!(at.with_timezone(&Utc), utc(6, 0, 15, 0));
        assert_eq!(due, vec![DAILY_JOB.to_string()]);

        // The wall clock still reads before the fire after the sleep ends.
        let fired = at.with_timezone(&Utc);
        let (at, due) = trigger.next_due(now, Some(fired)).unwrap();
        assert_eq!(at.with_timezone(&Utc), utc(6, 2, 15, 0));
        assert_eq!(due, vec![WEEKLY_JOB.to_string()]);

        let (at, _) = trigger.next_due(now, Some(at.with_timezone(&Utc))).unwrap();
        assert_eq!(at.with_timezone(&Utc), utc(7, 0, 15, 0));

        // A clock ahead of the last fire wins.
        let (at, _) = trigger.next_due(utc(8, 1, 0, 0), Some(fired)).unwrap();
        assert_eq!(at.with_timezone(&Utc), utc(9, 0, 15, 0));
    }
}
