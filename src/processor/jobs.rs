use crate::config::ScheduleConfig;
use crate::error::{GraphError, ScheduleError};
use crate::processor::cron::CronSchedule;
use crate::processor::pipeline::{ALL_NODES, WEEKLY_PORTFOLIO_RECOMMENDATION};

pub const DAILY_JOB: &str = "daily_pipeline";
pub const WEEKLY_JOB: &str = "weekly_portfolio_job";

/// A named, cron-triggered subset of the task graph.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub schedule: CronSchedule,
    /// Operator-facing only.
    pub description: String,
    pub nodes: Vec<String>,
}

impl JobDefinition {
    pub fn new<'a>(
        name: &str,
        cron: &str,
        description: &str,
        nodes: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            name: name.to_string(),
            schedule: CronSchedule::parse(cron)?,
            description: description.to_string(),
            nodes: nodes.into_iter().map(str::to_string).collect(),
        })
    }
}

/// The daily collection/analysis job and the weekly recommender job.
pub fn standard_jobs(schedule: &ScheduleConfig) -> Result<Vec<JobDefinition>, ScheduleError> {
    let daily = JobDefinition::new(
        DAILY_JOB,
        &schedule.daily_cron,
        "Daily data collection, news fetching, and AI analysis",
        ALL_NODES
            .iter()
            .copied()
            .filter(|n| *n != WEEKLY_PORTFOLIO_RECOMMENDATION),
    )?;
    let weekly = JobDefinition::new(
        WEEKLY_JOB,
        &schedule.weekly_cron,
        "Weekly portfolio recommendations for 3 risk profiles",
        [WEEKLY_PORTFOLIO_RECOMMENDATION],
    )?;
    Ok(vec![daily, weekly])
}

pub fn find_job<'a>(jobs: &'a [JobDefinition], name: &str) -> Result<&'a JobDefinition, GraphError> {
    jobs.iter()
        .find(|job| job.name == name)
        .ok_or_else(|| GraphError::UnknownJob(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn daily_and_weekly_partition_the_nodes() {
        let jobs = standard_jobs(&PipelineConfig::default().schedule).unwrap();
        let daily = find_job(&jobs, DAILY_JOB).unwrap();
        let weekly = find_job(&jobs, WEEKLY_JOB).unwrap();

        assert_eq!(daily.nodes.len(), ALL_NODES.len() - 1);
        assert!(!daily.nodes.iter().any(|n| n == WEEKLY_PORTFOLIO_RECOMMENDATION));
        assert_eq!(weekly.nodes, vec![WEEKLY_PORTFOLIO_RECOMMENDATION]);
        assert_eq!(daily.schedule.expression(), "15 2 * * *");
        assert_eq!(weekly.schedule.expression(), "15 4 * * 1");
        assert!(matches!(find_job(&jobs, "hourly"), Err(GraphError::UnknownJob(_))));
    }

    #[test]
    fn bad_cron_in_config_is_reported() {
        let mut schedule = PipelineConfig::default().schedule;
        schedule.weekly_cron = "every monday".to_string();
        assert!(matches!(
            standard_jobs(&schedule),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }
}
