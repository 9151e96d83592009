use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{
    BugReport, EVENT_BUG_FOUND, EVENT_JOB_STATUS, EventEnvelope, JobState, ReportingTransport,
    StatusEvent, TraceEvent, TraceSeverity, TraceTags, TransportError,
};
use crate::config::JobContext;

/// Subject pair for one job. Status and bug events share the events subject
/// so the control plane consumes them in publish order; traces ride a
/// sibling subject and never interleave with them.
#[derive(Debug, PartialEq, Eq)]
struct JobSubjects {
    events: String,
    trace: String,
}

impl JobSubjects {
    fn for_job(job_id: &str) -> Self {
        Self {
            events: format!("jobs.{job_id}.events"),
            trace: format!("jobs.{job_id}.trace"),
        }
    }
}

/// Direct broker transport: one NATS client for the process lifetime.
/// `flush` drains the client before the connection drops.
pub struct BrokerTransport {
    client: async_nats::Client,
    subjects: JobSubjects,
    ctx: JobContext,
}

impl BrokerTransport {
    pub async fn connect(url: &str, ctx: JobContext) -> Result<Self, TransportError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))?;
        Ok(Self {
            subjects: JobSubjects::for_job(&ctx.job_id),
            client,
            ctx,
        })
    }

    async fn publish<T: Serialize>(
        &self,
        subject: &str,
        body: &T,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(body)?;
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))
    }
}

#[async_trait]
impl ReportingTransport for BrokerTransport {
    async fn report_status(&self, state: JobState, details: Value) -> Result<(), TransportError> {
        debug!("Publishing job status event: {:?}", state);
        let envelope = EventEnvelope {
            event_type: EVENT_JOB_STATUS,
            message: StatusEvent::new(&self.ctx, state, details),
        };
        self.publish(&self.subjects.events, &envelope).await
    }

    async fn report_bug(&self, bug_details: Value) -> Result<(), TransportError> {
        debug!("Publishing bug found event");
        let envelope = EventEnvelope {
            event_type: EVENT_BUG_FOUND,
            message: BugReport::new(&self.ctx, bug_details),
        };
        self.publish(&self.subjects.events, &envelope).await
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
        self.publish(&self.subjects.trace, &trace).await
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))
    }
}
