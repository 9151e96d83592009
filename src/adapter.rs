use anyhow::anyhow;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthResolver, AuthSpec};
use crate::certs::CertificateInstaller;
use crate::config::{Descriptor, JobContext};
use crate::runner::{
    AnnotationHook, AnnotationSeverity, RunStats, RunnerConfig, ToolEvent, ToolRunner,
};
use crate::transport::{JobState, ReportingTransport, TraceSeverity};

/// Adapter lifecycle. Any step failure short-circuits to `Error`; both
/// terminal states flush exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    AuthResolving,
    CertInstalling,
    Configuring,
    Running,
    Completed,
    Error,
}

/// Wires a third-party tool to the reporting protocol: resolves auth,
/// installs certificates, configures and starts the tool, and maps each tool
/// event to a reporting call.
pub struct ToolAdapter {
    ctx: JobContext,
    descriptor: Descriptor,
    transport: Arc<dyn ReportingTransport>,
    resolver: AuthResolver,
    certificates: CertificateInstaller,
    runner: Option<Box<dyn ToolRunner>>,
    state: AgentState,
}

impl ToolAdapter {
    pub fn new(
        ctx: JobContext,
        descriptor: Descriptor,
        transport: Arc<dyn ReportingTransport>,
        resolver: AuthResolver,
        certificates: CertificateInstaller,
        runner: Box<dyn ToolRunner>,
    ) -> Self {
        Self {
            ctx,
            descriptor,
            transport,
            resolver,
            certificates,
            runner: Some(runner),
            state: AgentState::Idle,
        }
    }

    /// Drive the job to a terminal state. `flush` runs exactly once on every
    /// exit path, and no reporting call is issued after it begins.
    pub async fn run(mut self) -> AgentState {
        self.report_status(JobState::Created, Value::Null).await;

        match self.drive().await {
            Ok(stats) => {
                self.state = AgentState::Completed;
                info!("Tool run completed: {:?}", stats);
                let details = serde_json::to_value(&stats).unwrap_or(Value::Null);
                self.report_status(JobState::Completed, details).await;
            }
            Err(err) => {
                self.state = AgentState::Error;
                error!("Job failed: {:#}", err);
                self.log_exception(&err).await;
                self.report_status(JobState::Error, json!({"error": format!("{err:#}")}))
                    .await;
            }
        }

        if let Err(e) = self.transport.flush().await {
            warn!("Failed to flush the reporting transport: {}", e);
        }
        self.state
    }

    async fn drive(&mut self) -> anyhow::Result<RunStats> {
        self.state = AgentState::AuthResolving;
        let spec = AuthSpec::from_descriptor(self.descriptor.auth_section())?;
        let token = match &spec {
            Some(spec) => Some(self.resolver.resolve(spec).await?),
            None => {
                info!("No authentication method configured");
                None
            }
        };
        let target = self.descriptor.target()?;

        self.state = AgentState::CertInstalling;
        self.certificates
            .install(target.certificates_dir.as_deref())
            .await?;

        self.state = AgentState::Configuring;
        let mut config = RunnerConfig::new(
            &target,
            token.map(|t| t.header_value()),
            &self.ctx.work_directory,
        );
        if let Some(overrides) = self.descriptor.tool_overrides() {
            config.apply_overrides(&overrides);
        }

        self.state = AgentState::Running;
        let mut runner = self
            .runner
            .take()
            .ok_or_else(|| anyhow!("tool runner already consumed"))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ToolEvent>();
        // Error annotations become bug reports, then get downgraded so a
        // document-level issue never aborts the run.
        let hook: AnnotationHook = {
            let tx = tx.clone();
            Arc::new(move |annotation| {
                if annotation.severity == AnnotationSeverity::Error {
                    let _ = tx.send(ToolEvent::Annotation(annotation.clone()));
                    annotation.severity = AnnotationSeverity::Warning;
                }
            })
        };

        let transport = self.transport.clone();
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handle_event(transport.as_ref(), event).await;
            }
        });

        let result = runner.run(config, hook, tx).await;
        // All senders are gone once the runner returns; drain before the
        // terminal status so no Running event trails it.
        let _ = consumer.await;
        Ok(result?)
    }

    async fn report_status(&self, state: JobState, details: Value) {
        if let Err(e) = self.transport.report_status(state, details).await {
            warn!("Failed to report {:?} status: {}", state, e);
        }
    }

    async fn log_exception(&self, err: &anyhow::Error) {
        if let Err(e) = self
            .transport
            .log_trace(TraceSeverity::Error, &format!("{err:#}"))
            .await
        {
            warn!("Failed to log exception trace: {}", e);
        }
    }
}

/// Map one tool event to at most one reporting call. Transport failures are
/// logged and never change the run's outcome.
async fn handle_event(transport: &dyn ReportingTransport, event: ToolEvent) {
    match event {
        ToolEvent::GroupStarted {
            location,
            number_of_requests,
        } => {
            let details = json!({
                "location": location,
                "numberOfRequests": number_of_requests,
            });
            if let Err(e) = transport.report_status(JobState::Running, details).await {
                warn!("Failed to report Running status: {}", e);
            }
        }
        ToolEvent::CasePassed { title } => {
            debug!("Case passed: {}", title);
        }
        ToolEvent::CaseFailed {
            title,
            message,
            origin,
        } => {
            if let Err(e) = transport
                .report_bug(bug_details(origin, &title, &message))
                .await
            {
                warn!("Failed to report bug '{}': {}", title, e);
            }
        }
        ToolEvent::Annotation(annotation) => {
            if let Err(e) = transport
                .report_bug(bug_details(
                    annotation.origin,
                    &annotation.name,
                    &annotation.message,
                ))
                .await
            {
                warn!("Failed to report annotation '{}': {}", annotation.name, e);
            }
        }
    }
}

/// The tool's origin fields verbatim, plus the finding's name and message.
fn bug_details(origin: Value, name: &str, message: &str) -> Value {
    let mut details = match origin {
        Value::Object(map) => Value::Object(map),
        Value::Null => json!({}),
        other => json!({"origin": other}),
    };
    if let Some(map) = details.as_object_mut() {
        map.insert("name".to_string(), json!(name));
        map.insert("message".to_string(), json!(message));
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Annotation, ToolError};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Status(JobState, Value),
        Bug(Value),
        Trace(TraceSeverity, String),
        Flush,
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        fail_bugs: bool,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportingTransport for RecordingTransport {
        async fn report_status(
            &self,
            state: JobState,
            details: Value,
        ) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(Call::Status(state, details));
            Ok(())
        }

        async fn report_bug(&self, bug_details: Value) -> Result<(), TransportError> {
            if self.fail_bugs {
                return Err(TransportError::Broker("down".to_string()));
            }
            self.calls.lock().unwrap().push(Call::Bug(bug_details));
            Ok(())
        }

        async fn log_trace(
            &self,
            severity: TraceSeverity,
            message: &str,
        ) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Trace(severity, message.to_string()));
            Ok(())
        }

        async fn flush(&self) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(Call::Flush);
            Ok(())
        }
    }

    /// Emits a scripted event sequence, runs annotations through the hook,
    /// and returns a fixed outcome.
    struct ScriptedRunner {
        events: Vec<ToolEvent>,
        annotations: Vec<Annotation>,
        outcome: Result<RunStats, ToolError>,
        post_hook: Arc<Mutex<Vec<Annotation>>>,
    }

    #[async_trait]
    impl ToolRunner for ScriptedRunner {
        async fn run(
            &mut self,
            _config: RunnerConfig,
            annotation_hook: AnnotationHook,
            events: UnboundedSender<ToolEvent>,
        ) -> Result<RunStats, ToolError> {
            for mut annotation in self.annotations.drain(..) {
                annotation_hook(&mut annotation);
                self.post_hook.lock().unwrap().push(annotation);
            }
            for event in self.events.drain(..) {
                let _ = events.send(event);
            }
            std::mem::replace(&mut self.outcome, Ok(RunStats::default()))
        }
    }

    fn context() -> JobContext {
        JobContext {
            job_id: "job-1".to_string(),
            agent_name: "agent-0".to_string(),
            tool_name: "contract-runner".to_string(),
            task_index: "0".to_string(),
            work_directory: "/work".into(),
        }
    }

    fn descriptor(value: Value) -> Descriptor {
        Descriptor::from_value(value)
    }

    fn disabled_certs() -> CertificateInstaller {
        CertificateInstaller::with_paths("/tmp".into(), vec!["true".to_string()])
    }

    fn adapter(
        descriptor: Descriptor,
        transport: Arc<RecordingTransport>,
        runner: ScriptedRunner,
    ) -> ToolAdapter {
        ToolAdapter::new(
            context(),
            descriptor,
            transport,
            AuthResolver::new(None),
            disabled_certs(),
            Box::new(runner),
        )
    }

    fn states(calls: &[Call]) -> Vec<JobState> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Status(state, _) => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_run_reports_created_running_bug_completed_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let runner = ScriptedRunner {
            events: vec![
                ToolEvent::GroupStarted {
                    location: json!("GET /pets"),
                    number_of_requests: 2,
                },
                ToolEvent::GroupStarted {
                    location: json!("POST /pets"),
                    number_of_requests: 1,
                },
                ToolEvent::GroupStarted {
                    location: json!("GET /pets/{id}"),
                    number_of_requests: 3,
                },
                ToolEvent::CasePassed {
                    title: "GET /pets 200".to_string(),
                },
                ToolEvent::CaseFailed {
                    title: "POST /pets 201".to_string(),
                    message: "status mismatch".to_string(),
                    origin: json!({"resourceGroup": "Pets"}),
                },
            ],
            annotations: vec![],
            outcome: Ok(RunStats {
                tests: 6,
                passes: 5,
                failures: 1,
                errors: 0,
                duration_ms: 42,
            }),
            post_hook: Arc::new(Mutex::new(Vec::new())),
        };

        let terminal = adapter(
            descriptor(json!({"targetConfiguration": {"apiSpecifications": []}})),
            transport.clone(),
            runner,
        )
        .run()
        .await;

        assert_eq!(terminal, AgentState::Completed);
        let calls = transport.calls();
        assert_eq!(
            states(&calls),
            vec![
                JobState::Created,
                JobState::Running,
                JobState::Running,
                JobState::Running,
                JobState::Completed
            ]
        );
        // One bug for the failed case, none for the passed one.
        let bugs: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::Bug(_)))
            .collect();
        assert_eq!(bugs.len(), 1);
        match bugs[0] {
            Call::Bug(details) => {
                assert_eq!(details["name"], "POST /pets 201");
                assert_eq!(details["message"], "status mismatch");
                assert_eq!(details["resourceGroup"], "Pets");
            }
            _ => unreachable!(),
        }
        // Running statuses carry location and request count.
        match &calls[1] {
            Call::Status(JobState::Running, details) => {
                assert_eq!(details["location"], "GET /pets");
                assert_eq!(details["numberOfRequests"], 2);
            }
            other => panic!("unexpected call: {other:?}"),
        }
        // Completed details are the final statistics, and flush is last.
        match calls.iter().rev().nth(1) {
            Some(Call::Status(JobState::Completed, details)) => {
                assert_eq!(details["tests"], 6);
                assert_eq!(details["failures"], 1);
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert_eq!(calls.last(), Some(&Call::Flush));
        assert_eq!(
            calls.iter().filter(|c| matches!(c, Call::Flush)).count(),
            1
        );
    }

    #[tokio::test]
    async fn two_auth_methods_reach_created_then_error_without_starting_the_tool() {
        let transport = Arc::new(RecordingTransport::default());
        let runner = ScriptedRunner {
            events: vec![ToolEvent::GroupStarted {
                location: json!("never"),
                number_of_requests: 1,
            }],
            annotations: vec![],
            outcome: Ok(RunStats::default()),
            post_hook: Arc::new(Mutex::new(Vec::new())),
        };

        let terminal = adapter(
            descriptor(json!({
                "authenticationMethod": {"txttoken": "A", "commandline": "echo b"},
                "targetConfiguration": {"apiSpecifications": []}
            })),
            transport.clone(),
            runner,
        )
        .run()
        .await;

        assert_eq!(terminal, AgentState::Error);
        let calls = transport.calls();
        assert_eq!(states(&calls), vec![JobState::Created, JobState::Error]);
        match &calls[1] {
            Call::Trace(TraceSeverity::Error, message) => {
                assert!(message.contains("txttoken"));
                assert!(message.contains("commandline"));
            }
            other => panic!("unexpected call: {other:?}"),
        }
        match calls.iter().find(|c| matches!(c, Call::Status(JobState::Error, _))) {
            Some(Call::Status(_, details)) => {
                let detail = details["error"].as_str().unwrap();
                assert!(detail.contains("txttoken") && detail.contains("commandline"));
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert_eq!(calls.last(), Some(&Call::Flush));
        assert_eq!(
            calls.iter().filter(|c| matches!(c, Call::Flush)).count(),
            1
        );
    }

    #[tokio::test]
    async fn fatal_tool_error_reports_error_status_with_the_message() {
        let transport = Arc::new(RecordingTransport::default());
        let runner = ScriptedRunner {
            events: vec![],
            annotations: vec![],
            outcome: Err(ToolError::Exited {
                exit_code: 7,
                stderr: "hook crash".to_string(),
            }),
            post_hook: Arc::new(Mutex::new(Vec::new())),
        };

        let terminal = adapter(
            descriptor(json!({"targetConfiguration": {"apiSpecifications": []}})),
            transport.clone(),
            runner,
        )
        .run()
        .await;

        assert_eq!(terminal, AgentState::Error);
        let calls = transport.calls();
        assert_eq!(states(&calls), vec![JobState::Created, JobState::Error]);
        assert_eq!(calls.last(), Some(&Call::Flush));
    }

    #[tokio::test]
    async fn error_annotation_yields_one_bug_and_is_downgraded() {
        let transport = Arc::new(RecordingTransport::default());
        let post_hook = Arc::new(Mutex::new(Vec::new()));
        let runner = ScriptedRunner {
            events: vec![],
            annotations: vec![
                Annotation {
                    severity: AnnotationSeverity::Error,
                    name: "duplicate-path".to_string(),
                    message: "path declared twice".to_string(),
                    origin: json!({"filename": "petstore.yaml"}),
                },
                Annotation {
                    severity: AnnotationSeverity::Warning,
                    name: "deprecated-format".to_string(),
                    message: "old format".to_string(),
                    origin: Value::Null,
                },
            ],
            outcome: Ok(RunStats::default()),
            post_hook: post_hook.clone(),
        };

        let terminal = adapter(
            descriptor(json!({"targetConfiguration": {"apiSpecifications": []}})),
            transport.clone(),
            runner,
        )
        .run()
        .await;

        assert_eq!(terminal, AgentState::Completed);
        let calls = transport.calls();
        let bugs: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::Bug(_)))
            .collect();
        assert_eq!(bugs.len(), 1);
        match bugs[0] {
            Call::Bug(details) => {
                assert_eq!(details["name"], "duplicate-path");
                assert_eq!(details["filename"], "petstore.yaml");
            }
            _ => unreachable!(),
        }

        let post = post_hook.lock().unwrap();
        assert_eq!(post[0].severity, AnnotationSeverity::Warning);
        assert_eq!(post[1].severity, AnnotationSeverity::Warning);
    }

    #[tokio::test]
    async fn transport_failure_on_bug_report_does_not_change_the_outcome() {
        let transport = Arc::new(RecordingTransport {
            calls: Mutex::new(Vec::new()),
            fail_bugs: true,
        });
        let runner = ScriptedRunner {
            events: vec![ToolEvent::CaseFailed {
                title: "POST /pets 201".to_string(),
                message: "status mismatch".to_string(),
                origin: Value::Null,
            }],
            annotations: vec![],
            outcome: Ok(RunStats {
                tests: 1,
                passes: 0,
                failures: 1,
                errors: 0,
                duration_ms: 3,
            }),
            post_hook: Arc::new(Mutex::new(Vec::new())),
        };

        let terminal = adapter(
            descriptor(json!({"targetConfiguration": {"apiSpecifications": []}})),
            transport.clone(),
            runner,
        )
        .run()
        .await;

        assert_eq!(terminal, AgentState::Completed);
        let calls = transport.calls();
        assert_eq!(
            states(&calls),
            vec![JobState::Created, JobState::Completed]
        );
        assert_eq!(calls.last(), Some(&Call::Flush));
    }

    #[test]
    fn bug_details_merges_origin_verbatim() {
        let details = bug_details(
            json!({"filename": "petstore.yaml", "position": 12}),
            "dup",
            "boom",
        );
        assert_eq!(details["filename"], "petstore.yaml");
        assert_eq!(details["position"], 12);
        assert_eq!(details["name"], "dup");
        assert_eq!(details["message"], "boom");

        let from_null = bug_details(Value::Null, "n", "m");
        assert_eq!(from_null["name"], "n");

        let from_scalar = bug_details(json!("somewhere"), "n", "m");
        assert_eq!(from_scalar["origin"], "somewhere");
        assert_eq!(from_scalar["name"], "n");
    }
}
