//! Task graph, executor and the cron-driven job trigger.

pub mod calendar;
pub mod cron;
pub mod executor;
pub mod graph;
pub mod job;
pub mod jobs;
pub mod pipeline;
pub mod trigger;

pub use self::executor::{Executor, ExecutorConfig};
pub use self::graph::{NodeSpec, QuotaGroup, TaskGraph, TaskGraphBuilder, UpstreamPolicy};
pub use self::job::{NodeAction, NodeGroup, NodeRecord, NodeStatus, RunContext, RunSummary};
pub use self::jobs::{JobDefinition, DAILY_JOB, WEEKLY_JOB};
pub use self::trigger::Trigger;
