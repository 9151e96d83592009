mod process;

pub use process::ProcessRunner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{TargetConfiguration, ToolConfiguration};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start the tool: {0}")]
    Spawn(std::io::Error),
    #[error("tool i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tool exited with code {exit_code}: {stderr}")]
    Exited { exit_code: i32, stderr: String },
    #[error("tool protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationSeverity {
    Error,
    Warning,
    /// Severities outside the known set pass through verbatim.
    #[serde(untagged)]
    Other(String),
}

/// A structural finding emitted while the tool parses the API description,
/// distinct from a test-case result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub severity: AnnotationSeverity,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub origin: Value,
}

/// Events a tool integration surfaces while running.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// A suite/group of transactions started.
    GroupStarted {
        location: Value,
        number_of_requests: u64,
    },
    CasePassed {
        title: String,
    },
    CaseFailed {
        title: String,
        message: String,
        origin: Value,
    },
    Annotation(Annotation),
}

/// Final statistics of a completed run, reported as `Completed` details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunStats {
    pub tests: u64,
    pub passes: u64,
    pub failures: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

/// Extension point invoked for each annotation after description parsing and
/// before execution; may rewrite the annotation in place. The tool's own
/// artifacts reflect the rewritten form.
pub type AnnotationHook = Arc<dyn Fn(&mut Annotation) + Send + Sync>;

/// Configuration handed to the wrapped tool. Serialized as the tool's own
/// option names (`dry-run`, `hookfiles`, ...).
#[derive(Debug, Clone, Serialize)]
pub struct RunnerConfig {
    pub endpoint: Option<String>,
    pub path: Vec<String>,
    pub header: Vec<String>,
    #[serde(rename = "dry-run")]
    pub dry_run: bool,
    pub only: Vec<String>,
    pub hookfiles: Vec<String>,
    pub require: Option<String>,
    pub sorted: bool,
    pub reporter: Vec<String>,
    pub output: Vec<String>,
}

impl RunnerConfig {
    /// Base configuration from the target plus the resolved auth header.
    pub fn new(
        target: &TargetConfiguration,
        auth_header: Option<String>,
        work_directory: &Path,
    ) -> Self {
        Self {
            endpoint: target.endpoint.clone(),
            path: target.api_specifications.clone(),
            header: auth_header
                .map(|h| vec![format!("Authorization: {h}")])
                .unwrap_or_default(),
            dry_run: false,
            only: Vec::new(),
            hookfiles: Vec::new(),
            require: None,
            sorted: false,
            reporter: vec!["markdown".to_string(), "html".to_string()],
            output: vec![
                work_directory.join("report.md").display().to_string(),
                work_directory.join("report.html").display().to_string(),
            ],
        }
    }

    /// Merge descriptor overrides: header lists are additive, scalar flags
    /// override.
    pub fn apply_overrides(&mut self, overrides: &ToolConfiguration) {
        self.header.extend(overrides.header.iter().cloned());
        if let Some(dry_run) = overrides.dry_run {
            self.dry_run = dry_run;
        }
        if let Some(only) = &overrides.only {
            self.only = only.clone();
        }
        if let Some(hookfiles) = &overrides.hookfiles {
            self.hookfiles = hookfiles.clone();
        }
        if let Some(require) = &overrides.require {
            self.require = Some(require.clone());
        }
        if let Some(sorted) = overrides.sorted {
            self.sorted = sorted;
        }
    }
}

/// A third-party tool integration: starts the tool, surfaces its event
/// stream, and returns its final statistics or a fatal error. Per-case
/// failures are findings, not errors.
#[async_trait]
pub trait ToolRunner: Send {
    async fn run(
        &mut self,
        config: RunnerConfig,
        annotation_hook: AnnotationHook,
        events: UnboundedSender<ToolEvent>,
    ) -> Result<RunStats, ToolError>;
}
