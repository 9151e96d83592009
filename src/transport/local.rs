use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use super::{JobState, ReportingTransport, TraceSeverity, TransportError};
use crate::config::JobContext;

/// No-op transport for runs outside the managed job backend. Events are
/// echoed to the console so a local developer still sees the run unfold.
pub struct LocalTransport {
    ctx: JobContext,
}

impl LocalTransport {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReportingTransport for LocalTransport {
    async fn report_status(&self, state: JobState, details: Value) -> Result<(), TransportError> {
        info!("[{}] job status: {:?} {}", self.ctx.job_id, state, details);
        Ok(())
    }

    async fn report_bug(&self, bug_details: Value) -> Result<(), TransportError> {
        info!("[{}] bug found: {}", self.ctx.job_id, bug_details);
        Ok(())
    }

    async fn log_trace(
        &self,
        severity: TraceSeverity,
        message: &str,
    ) -> Result<(), TransportError> {
        match severity {
            TraceSeverity::Information => info!("[{}] {}", self.ctx.job_id, message),
            TraceSeverity::Error => error!("[{}] {}", self.ctx.job_id, message),
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
