use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{
    BugReport, EventEnvelope, JobState, ReportingTransport, StatusEvent, TraceEvent,
    TraceSeverity, TraceTags, TransportError,
};
use crate::config::JobContext;

const EVENT_NAME_JOB_STATUS: &str = "jobStatus";
const EVENT_NAME_BUG_FOUND: &str = "bugFound";

/// Relays every reporting operation as an HTTP POST to a co-located agent
/// utilities process, for topologies where the agent holds no broker or
/// telemetry credentials.
pub struct SidecarTransport {
    http: reqwest::Client,
    base: String,
    ctx: JobContext,
}

impl SidecarTransport {
    pub fn new(base: String, ctx: JobContext) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            ctx,
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), TransportError> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status(),
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReportingTransport for SidecarTransport {
    async fn report_status(&self, state: JobState, details: Value) -> Result<(), TransportError> {
        debug!("Relaying job status event: {:?}", state);
        let event = StatusEvent::new(&self.ctx, state, details);
        self.post(&format!("/messaging/event/{EVENT_NAME_JOB_STATUS}"), &event)
            .await
    }

    async fn report_bug(&self, bug_details: Value) -> Result<(), TransportError> {
        debug!("Relaying bug found event");
        let bug = BugReport::new(&self.ctx, bug_details);
        self.post(&format!("/messaging/event/{EVENT_NAME_BUG_FOUND}"), &bug)
            .await
    }

    async fn log_trace(
        &self,
        severity: TraceSeverity,
        message: &str,
    ) -> Result<(), TransportError> {
        let trace = TraceEvent {
            message: message.to_string(),
            severity,
            tags: TraceTags::from_context(&self.ctx),
        };
        self.post("/messaging/trace", &trace).await
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.post("/messaging/flush", &serde_json::json!({})).await
    }
}
