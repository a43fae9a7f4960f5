mod common;

use chrono::{TimeZone, Utc};
use common::{harness, run_date, test_config};
use dipsignal_pipeline::database::models::{AssetClass, MonitoredTable};
use dipsignal_pipeline::database::Warehouse;
use dipsignal_pipeline::monitor::{check_coverage, check_freshness, FreshnessStatus};
use dipsignal_pipeline::processor::jobs::standard_jobs;
use dipsignal_pipeline::processor::pipeline::{build_graph, ALL_NODES, WEEKLY_PORTFOLIO_RECOMMENDATION};
use dipsignal_pipeline::processor::{Executor, ExecutorConfig, NodeStatus, Trigger, DAILY_JOB};
use std::sync::Arc;
use tokio::sync::watch;

fn trigger(h: &common::Harness) -> (Trigger, String) {
    let config = test_config();
    let graph = build_graph(&config, &h.deps).unwrap();
    let executor = Executor::new(Arc::new(graph), ExecutorConfig::from(&config.scheduler));
    let jobs = standard_jobs(&config.schedule).unwrap();
    let log = config.logs.run_log_path.clone();
    (Trigger::new(executor, jobs, h.deps.lock.clone(), &config).unwrap(), log)
}

#[tokio::test]
async fn daily_job_populates_every_daily_table() {
    let h = harness();
    let (trigger, log) = trigger(&h);
    let (_tx, rx) = watch::channel(false);

    let summary = trigger.run_job(DAILY_JOB, run_date(), rx).await.unwrap().unwrap();

    for name in ALL_NODES.iter().filter(|n| **n != WEEKLY_PORTFOLIO_RECOMMENDATION) {
        assert_eq!(
            summary.status_of(name),
            Some(NodeStatus::Succeeded),
            "{} did not succeed: {:?}",
            name,
            summary.node(name)
        );
    }
    assert!(summary.node(WEEKLY_PORTFOLIO_RECOMMENDATION).is_none());
    assert_eq!(summary.failed, 0);

    let w = &h.warehouse;
    assert_eq!(w.list_assets(None).await.unwrap().len(), 3);
    assert_eq!(w.top_news_for(run_date()).await.unwrap().len(), 5);
    assert!(w.macro_summary_for(run_date()).await.unwrap().is_some());
    assert_eq!(w.latest_analyses().await.unwrap().len(), 3);
    assert!(w.unsummarized_articles(None).await.unwrap().is_empty());

    let coverage = check_coverage(w.as_ref(), run_date() - chrono::Duration::days(1)).await.unwrap();
    assert_eq!(coverage.assets_with_data, 3);
    assert!(coverage.is_complete());
    assert!(coverage.classes.iter().any(|c| c.asset_class == AssetClass::Commodity));

    let noon = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let freshness = check_freshness(w.as_ref(), noon).await.unwrap();
    let status = |t: MonitoredTable| freshness.iter().find(|r| r.table == t).unwrap().status;
    assert_eq!(status(MonitoredTable::NewsArticles), FreshnessStatus::Fresh);
    assert_eq!(status(MonitoredTable::TopNews), FreshnessStatus::Fresh);
    assert_eq!(status(MonitoredTable::PortfolioRecommendations), FreshnessStatus::Critical);

    let logged = std::fs::read_to_string(&log).unwrap();
    assert_eq!(logged.lines().count(), 1);
    let _ = std::fs::remove_file(log);
}

#[tokio::test]
async fn rerunning_the_same_day_changes_nothing() {
    let h = harness();
    let (trigger, log) = trigger(&h);

    let (_tx, rx) = watch::channel(false);
    trigger.run_job(DAILY_JOB, run_date(), rx.clone()).await.unwrap().unwrap();
    let calls = h.llm.calls();
    let mut counts = Vec::new();
    for table in MonitoredTable::ALL {
        counts.push(h.warehouse.row_count(table).await.unwrap());
    }

    let again = trigger.run_job(DAILY_JOB, run_date(), rx).await.unwrap().unwrap();
    assert_eq!(again.failed, 0);
    // Summaries, ranking, macro narrative and analyses all exist already.
    assert_eq!(h.llm.calls(), calls);
    for (table, before) in MonitoredTable::ALL.into_iter().zip(counts) {
        assert_eq!(h.warehouse.row_count(table).await.unwrap(), before, "{:?}", table);
    }
    let _ = std::fs::remove_file(log);
}

#[tokio::test]
async fn shutdown_before_start_skips_everything() {
    let h = harness();
    let (trigger, log) = trigger(&h);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let summary = trigger.run_job(DAILY_JOB, run_date(), rx).await.unwrap().unwrap();
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.skipped, ALL_NODES.len() - 1);
    assert_eq!(h.llm.calls(), 0);
    let _ = std::fs::remove_file(log);
}
