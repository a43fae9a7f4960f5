use crate::config::SchedulerConfig;
use crate::error::{GraphError, NodeError};
use crate::processor::graph::{NodeSpec, QuotaGroup, TaskGraph, UpstreamPolicy};
use crate::processor::job::{NodeGroup, NodeRecord, NodeStatus, RunContext, RunSummary};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// How often a node blocked by another run's quota holder re-checks the gate.
const QUOTA_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrency: usize,
    pub quota_spacing: HashMap<QuotaGroup, Duration>,
    /// Applied to nodes that do not carry their own timeout.
    pub default_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let mut quota_spacing = HashMap::new();
        quota_spacing.insert(QuotaGroup::Yahoo, Duration::from_secs(3));
        quota_spacing.insert(QuotaGroup::Llm, Duration::from_secs(2));
        Self {
            max_concurrency: 4,
            quota_spacing,
            default_timeout: None,
        }
    }
}

impl From<&SchedulerConfig> for ExecutorConfig {
    fn from(config: &SchedulerConfig) -> Self {
        let mut quota_spacing = HashMap::new();
        quota_spacing.insert(QuotaGroup::Yahoo, Duration::from_secs(config.yahoo_spacing_secs));
        quota_spacing.insert(QuotaGroup::Llm, Duration::from_secs(config.llm_spacing_secs));
        Self {
            max_concurrency: config.max_concurrency.max(1),
            quota_spacing,
            default_timeout: config.node_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    busy: bool,
    last_start: Option<Instant>,
}

enum Admission {
    Granted(QuotaPermit),
    /// Spacing not yet elapsed; retry at the given instant.
    NotBefore(Instant),
    Busy,
}

/// Mutual exclusion plus start-to-start spacing per quota group. Shared by
/// every run of one executor so overlapping jobs respect the same quotas.
#[derive(Debug)]
struct QuotaGate {
    spacing: HashMap<QuotaGroup, Duration>,
    state: Mutex<HashMap<QuotaGroup, GateState>>,
}

impl QuotaGate {
    fn new(spacing: HashMap<QuotaGroup, Duration>) -> Self {
        Self {
            spacing,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn try_enter(self: &Arc<Self>, group: QuotaGroup, now: Instant) -> Admission {
        let spacing = self.spacing.get(&group).copied().unwrap_or_default();
        let mut state = self.state.lock();
        let gate = state.entry(group).or_default();
        if gate.busy {
            return Admission::Busy;
        }
        if let Some(last) = gate.last_start {
            let allowed = last + spacing;
            if now < allowed {
                return Admission::NotBefore(allowed);
            }
        }
        gate.busy = true;
        gate.last_start = Some(now);
        Admission::Granted(QuotaPermit {
            gate: Arc::clone(self),
            group,
        })
    }

    fn leave(&self, group: QuotaGroup) {
        if let Some(gate) = self.state.lock().get_mut(&group) {
            gate.busy = false;
        }
    }
}

/// Releases the quota group when the node's task ends, panics included.
struct QuotaPermit {
    gate: Arc<QuotaGate>,
    group: QuotaGroup,
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.gate.leave(self.group);
    }
}

struct Finished {
    name: String,
    outcome: Result<Value, NodeError>,
    duration_ms: u64,
}

/// Runs a subset of a [`TaskGraph`] to completion.
#[derive(Clone)]
pub struct Executor {
    graph: Arc<TaskGraph>,
    config: ExecutorConfig,
    gate: Arc<QuotaGate>,
}

impl Executor {
    pub fn new(graph: Arc<TaskGraph>, config: ExecutorConfig) -> Self {
        let gate = Arc::new(QuotaGate::new(config.quota_spacing.clone()));
        Self {
            graph,
            config,
            gate,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Executes `subset` in dependency order. Node failures end up in the
    /// summary; only an invalid subset is an error.
    #[instrument(skip(self, subset, ctx), fields(job = %ctx.job, run_id = %ctx.run_id))]
    pub async fn run<S: AsRef<str>>(&self, subset: &[S], ctx: &RunContext) -> Result<RunSummary, GraphError> {
        let order = self.graph.execution_order(subset)?;
        info!("Executing {} nodes: {}", order.len(), order.join(", "));

        let in_run: Vec<&str> = order.iter().map(String::as_str).collect();
        let mut pending: Vec<Arc<NodeSpec>> = order
            .iter()
            .filter_map(|name| self.graph.node(name).cloned())
            .collect();
        let mut statuses: BTreeMap<String, NodeStatus> = BTreeMap::new();
        let mut records: HashMap<String, NodeRecord> = HashMap::new();
        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut shutdown = ctx.shutdown_signal();
        let mut shutdown_open = true;

        loop {
            if ctx.is_shutting_down() && !pending.is_empty() {
                warn!("Shutdown requested - skipping {} pending nodes", pending.len());
                for spec in pending.drain(..) {
                    statuses.insert(spec.name.clone(), NodeStatus::Skipped);
                    records.insert(
                        spec.name.clone(),
                        NodeRecord::skipped(&spec.name, spec.group, "shutdown requested"),
                    );
                }
            }

            let mut wake_at: Option<Instant> = None;
            let mut i = 0;
            while i < pending.len() {
                let spec = Arc::clone(&pending[i]);
                let upstream: BTreeMap<String, NodeStatus> = spec
                    .dependencies
                    .iter()
                    .filter(|d| in_run.contains(&d.as_str()))
                    .map(|d| (d.clone(), statuses.get(d).copied()))
                    .filter_map(|(d, status)| status.map(|s| (d, s)))
                    .collect();
                let waiting = spec
                    .dependencies
                    .iter()
                    .filter(|d| in_run.contains(&d.as_str()))
                    .count()
                    > upstream.len();
                if waiting {
                    i += 1;
                    continue;
                }

                if spec.upstream_policy == UpstreamPolicy::SkipOnFailure {
                    let failed: Vec<&str> = upstream
                        .iter()
                        .filter(|(_, s)| **s != NodeStatus::Succeeded)
                        .map(|(d, _)| d.as_str())
                        .collect();
                    if !failed.is_empty() {
                        let reason = format!("upstream did not succeed: {}", failed.join(", "));
                        warn!("Skipping {}: {}", spec.name, reason);
                        statuses.insert(spec.name.clone(), NodeStatus::Skipped);
                        records.insert(spec.name.clone(), NodeRecord::skipped(&spec.name, spec.group, &reason));
                        pending.remove(i);
                        // A skip can unblock nodes earlier in the list.
                        i = 0;
                        continue;
                    }
                }

                if running.len() >= self.config.max_concurrency {
                    break;
                }

                let permit = match spec.quota {
                    None => None,
                    Some(group) => match self.gate.try_enter(group, Instant::now()) {
                        Admission::Granted(permit) => Some(permit),
                        Admission::NotBefore(at) => {
                            wake_at = Some(wake_at.map_or(at, |w| w.min(at)));
                            i += 1;
                            continue;
                        }
                        Admission::Busy => {
                            let at = Instant::now() + QUOTA_POLL;
                            wake_at = Some(wake_at.map_or(at, |w| w.min(at)));
                            i += 1;
                            continue;
                        }
                    },
                };

                pending.remove(i);
                self.spawn_node(&mut running, spec, ctx.for_node(upstream), permit);
            }

            if pending.is_empty() && running.is_empty() {
                break;
            }
            if running.is_empty() && wake_at.is_none() {
                // Nothing in flight and nothing startable.
                error!("{} nodes can never start", pending.len());
                for spec in pending.drain(..) {
                    records.insert(
                        spec.name.clone(),
                        NodeRecord::skipped(&spec.name, spec.group, "unsatisfiable dependencies"),
                    );
                }
                break;
            }

            let sleep_target = wake_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                joined = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Some(Ok(finished)) => {
                            let record = self.record(finished);
                            statuses.insert(record.name.clone(), record.status);
                            records.insert(record.name.clone(), record);
                        }
                        Some(Err(e)) => error!("Node task ended abnormally: {}", e),
                        None => {}
                    }
                }
                _ = tokio::time::sleep_until(sleep_target), if wake_at.is_some() => {}
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    }
                }
            }
        }

        let nodes = order
            .iter()
            .map(|name| {
                records
                    .remove(name)
                    .unwrap_or_else(|| NodeRecord::skipped(name, self.group_of(name), "no outcome recorded"))
            })
            .collect();
        let summary = RunSummary::new(ctx, nodes);
        info!(
            "Job {} finished: {} succeeded, {} failed, {} skipped",
            summary.job, summary.succeeded, summary.failed, summary.skipped
        );
        Ok(summary)
    }

    fn spawn_node(
        &self,
        running: &mut JoinSet<Finished>,
        spec: Arc<NodeSpec>,
        node_ctx: RunContext,
        permit: Option<QuotaPermit>,
    ) {
        let timeout = spec.timeout.or(self.config.default_timeout);
        info!("Starting node {} ({})", spec.name, spec.group);
        running.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let action = spec.action.execute(&node_ctx);
            let guarded = AssertUnwindSafe(async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, action)
                        .await
                        .unwrap_or(Err(NodeError::Timeout(limit))),
                    None => action.await,
                }
            })
            .catch_unwind();
            let outcome = guarded
                .await
                .unwrap_or_else(|_| Err(NodeError::Transient("node action panicked".to_string())));
            Finished {
                name: spec.name.clone(),
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        });
    }

    fn group_of(&self, name: &str) -> NodeGroup {
        self.graph
            .node(name)
            .map(|s| s.group)
            .unwrap_or(NodeGroup::AiAnalysis)
    }

    fn record(&self, finished: Finished) -> NodeRecord {
        let group = self.group_of(&finished.name);
        match finished.outcome {
            Ok(metadata) => {
                info!("Node {} succeeded in {} ms", finished.name, finished.duration_ms);
                NodeRecord::succeeded(&finished.name, group, finished.duration_ms, metadata)
            }
            Err(e) => {
                error!("Node {} failed after {} ms: {}", finished.name, finished.duration_ms, e);
                NodeRecord::failed(&finished.name, group, finished.duration_ms, &e)
            }
        }
    }
}
