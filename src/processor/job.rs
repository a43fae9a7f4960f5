use crate::error::NodeError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::watch;
use uuid::Uuid;

/// Coarse grouping shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeGroup {
    DataCollection,
    NewsCollection,
    AiAnalysis,
}

impl NodeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeGroup::DataCollection => "data_collection",
            NodeGroup::NewsCollection => "news_collection",
            NodeGroup::AiAnalysis => "ai_analysis",
        }
    }
}

impl fmt::Display for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Succeeded => write!(f, "succeeded"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-run state handed to every node action.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub job: String,
    /// Calendar date the run is working on (scheduler timezone).
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    /// Completion status of this node's declared upstreams.
    pub upstream: BTreeMap<String, NodeStatus>,
    shutdown: watch::Receiver<bool>,
}

impl RunContext {
    pub fn new(job: &str, run_date: NaiveDate, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job: job.to_string(),
            run_date,
            started_at: Utc::now(),
            upstream: BTreeMap::new(),
            shutdown,
        }
    }

    /// Context for ad-hoc invocations that can never be cancelled.
    pub fn detached(job: &str, run_date: NaiveDate) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(job, run_date, rx)
    }

    pub fn for_node(&self, upstream: BTreeMap<String, NodeStatus>) -> Self {
        Self {
            upstream,
            ..self.clone()
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn failed_upstreams(&self) -> Vec<&str> {
        self.upstream
            .iter()
            .filter(|(_, status)| **status != NodeStatus::Succeeded)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

/// The executable part of a graph node. The returned value becomes the
/// node's metadata in the run summary.
#[async_trait]
pub trait NodeAction: Send + Sync {
    async fn execute(&self, ctx: &RunContext) -> Result<Value, NodeError>;
}

/// Outcome of one node within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub group: NodeGroup,
    pub status: NodeStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl NodeRecord {
    pub fn succeeded(name: &str, group: NodeGroup, duration_ms: u64, metadata: Value) -> Self {
        Self {
            name: name.to_string(),
            group,
            status: NodeStatus::Succeeded,
            duration_ms,
            metadata: Some(metadata),
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(name: &str, group: NodeGroup, duration_ms: u64, error: &NodeError) -> Self {
        Self {
            name: name.to_string(),
            group,
            status: NodeStatus::Failed,
            duration_ms,
            metadata: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
        }
    }

    pub fn skipped(name: &str, group: NodeGroup, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            group,
            status: NodeStatus::Skipped,
            duration_ms: 0,
            metadata: None,
            error: Some(reason.to_string()),
            error_kind: None,
        }
    }
}

/// Structured summary emitted once per job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<NodeRecord>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn new(ctx: &RunContext, nodes: Vec<NodeRecord>) -> Self {
        let count = |status| nodes.iter().filter(|n| n.status == status).count();
        Self {
            run_id: ctx.run_id,
            job: ctx.job.clone(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            succeeded: count(NodeStatus::Succeeded),
            failed: count(NodeStatus::Failed),
            skipped: count(NodeStatus::Skipped),
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<NodeStatus> {
        self.node(name).map(|n| n.status)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_counts_statuses() {
        let ctx = RunContext::detached("daily_pipeline", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        let nodes = vec![
            NodeRecord::succeeded("a", NodeGroup::DataCollection, 10, json!({"records_written": 3})),
            NodeRecord::failed(
                "b",
                NodeGroup::AiAnalysis,
                5,
                &NodeError::PreconditionMissing("no macro summary".into()),
            ),
            NodeRecord::skipped("c", NodeGroup::AiAnalysis, "shutdown requested"),
        ];
        let summary = RunSummary::new(&ctx, nodes);
        assert_eq!((summary.succeeded, summary.failed, summary.skipped), (1, 1, 1));
        assert_eq!(summary.status_of("b"), Some(NodeStatus::Failed));
        assert!(!summary.is_clean());

        let line = serde_json::to_value(&summary).unwrap();
        assert_eq!(line["nodes"][1]["error_kind"], "precondition_missing");
        assert_eq!(line["nodes"][0]["group"], "data_collection");
        assert!(line["nodes"][0].get("error").is_none());
    }

    #[test]
    fn failed_upstreams_lists_non_successes() {
        let ctx = RunContext::detached("daily_pipeline", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        let mut upstream = BTreeMap::new();
        upstream.insert("a".to_string(), NodeStatus::Failed);
        upstream.insert("b".to_string(), NodeStatus::Succeeded);
        upstream.insert("c".to_string(), NodeStatus::Skipped);
        let node_ctx = ctx.for_node(upstream);
        assert_eq!(node_ctx.failed_upstreams(), vec!["a", "c"]);
        assert_eq!(node_ctx.run_id, ctx.run_id);
        assert!(!node_ctx.is_shutting_down());
    }
}
