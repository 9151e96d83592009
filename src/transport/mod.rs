mod broker;
mod local;
mod sidecar;

pub use broker::BrokerTransport;
pub use local::LocalTransport;
pub use sidecar::SidecarTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{AgentEnv, JobContext};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("reporting call failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay returned HTTP {status} for {path}")]
    Status {
        status: reqwest::StatusCode,
        path: String,
    },
    #[error("broker error: {0}")]
    Broker(String),
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Job lifecycle states reported to the backend. Transitions are monotonic:
/// `Created -> Running* -> (Completed | Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Created,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceSeverity {
    Information,
    Error,
}

/// Correlation tags attached to every trace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceTags {
    pub job_id: String,
    pub task_index: String,
    pub container_name: String,
}

impl TraceTags {
    pub fn from_context(ctx: &JobContext) -> Self {
        Self {
            job_id: ctx.job_id.clone(),
            task_index: ctx.task_index.clone(),
            container_name: ctx.agent_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub message: String,
    pub severity: TraceSeverity,
    pub tags: TraceTags,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub tool: String,
    pub job_id: String,
    pub agent_name: String,
    pub state: JobState,
    pub details: Value,
    pub utc_event_time: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(ctx: &JobContext, state: JobState, details: Value) -> Self {
        Self {
            tool: ctx.tool_name.clone(),
            job_id: ctx.job_id.clone(),
            agent_name: ctx.agent_name.clone(),
            state,
            details,
            utc_event_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BugReport {
    pub tool: String,
    pub job_id: String,
    pub agent_name: String,
    /// Tool-specific location metadata plus the finding's name and message,
    /// copied verbatim from the tool.
    pub bug_details: Value,
}

impl BugReport {
    pub fn new(ctx: &JobContext, bug_details: Value) -> Self {
        Self {
            tool: ctx.tool_name.clone(),
            job_id: ctx.job_id.clone(),
            agent_name: ctx.agent_name.clone(),
            bug_details,
        }
    }
}

/// Envelope published to the backend for status and bug events.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T: Serialize> {
    pub event_type: &'static str,
    pub message: T,
}

pub const EVENT_JOB_STATUS: &str = "JobStatus";
pub const EVENT_BUG_FOUND: &str = "BugFound";

/// One interface over the three wire mechanics (no-op, broker, sidecar
/// relay). Exactly one outbound call per logical event; no batching, no
/// retry. `flush` is a barrier: nothing may be reported after it begins.
#[async_trait]
pub trait ReportingTransport: Send + Sync {
    async fn report_status(&self, state: JobState, details: Value) -> Result<(), TransportError>;
    async fn report_bug(&self, bug_details: Value) -> Result<(), TransportError>;
    async fn log_trace(&self, severity: TraceSeverity, message: &str)
    -> Result<(), TransportError>;
    async fn flush(&self) -> Result<(), TransportError>;
}

/// Pick the transport variant from the environment: explicit local mode,
/// then the sidecar relay, then the direct broker connection. With nothing
/// configured the agent behaves as a local developer run.
pub async fn from_env(
    env: &AgentEnv,
    ctx: JobContext,
) -> Result<Arc<dyn ReportingTransport>, TransportError> {
    if env.local {
        info!("Reporting transport: local (no-op)");
        return Ok(Arc::new(LocalTransport::new(ctx)));
    }
    if let Some(base) = &env.agent_utilities_url {
        info!("Reporting transport: sidecar relay at {}", base);
        return Ok(Arc::new(SidecarTransport::new(base.clone(), ctx)));
    }
    if let Some(url) = &env.broker_url {
        info!("Reporting transport: direct broker at {}", url);
        return Ok(Arc::new(BrokerTransport::connect(url, ctx).await?));
    }
    info!("No transport configured; falling back to local (no-op)");
    Ok(Arc::new(LocalTransport::new(ctx)))
}
