use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::{
    Annotation, AnnotationHook, RunStats, RunnerConfig, ToolError, ToolEvent, ToolRunner,
};
use crate::config::AgentEnv;

/// Wire protocol line emitted by the wrapped tool on stdout, one JSON object
/// per line. Anything that does not parse is treated as tool chatter.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum WireEvent {
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
        #[serde(default)]
        origin: Value,
    },
    Annotation(Annotation),
    Result(RunStats),
}

/// Drives the tool as a subprocess: configuration on stdin, NDJSON events on
/// stdout. Post-hook annotations are recorded to `annotations.json` under
/// the work directory; the `result` line carries the final statistics.
pub struct ProcessRunner {
    command: PathBuf,
    work_directory: PathBuf,
}

impl ProcessRunner {
    pub fn new(command: PathBuf, work_directory: PathBuf) -> Self {
        Self {
            command,
            work_directory,
        }
    }

    /// Command resolution: explicit override, else `<tool run dir>/run`.
    pub fn from_env(env: &AgentEnv) -> Self {
        let command = env
            .tool_command
            .clone()
            .unwrap_or_else(|| env.tool_run_directory.join("run"));
        Self::new(command, env.work_directory.clone())
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &mut self,
        config: RunnerConfig,
        annotation_hook: AnnotationHook,
        events: UnboundedSender<ToolEvent>,
    ) -> Result<RunStats, ToolError> {
        info!("Starting tool: {}", self.command.display());
        let mut child = tokio::process::Command::new(&self.command)
            .current_dir(&self.work_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ToolError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&config)
                .map_err(|e| ToolError::Protocol(e.to_string()))?;
            stdin.write_all(&payload).await?;
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Protocol("tool stdout is not piped".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolError::Protocol("tool stderr is not piped".to_string()))?;
        // Drained concurrently with stdout: a tool that fills the stderr pipe
        // mid-run would otherwise block and stop producing stdout.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut annotations: Vec<Annotation> = Vec::new();
        let mut stats: Option<RunStats> = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WireEvent>(&line) {
                Ok(WireEvent::GroupStarted {
                    location,
                    number_of_requests,
                }) => {
                    let _ = events.send(ToolEvent::GroupStarted {
                        location,
                        number_of_requests,
                    });
                }
                Ok(WireEvent::CasePassed { title }) => {
                    let _ = events.send(ToolEvent::CasePassed { title });
                }
                Ok(WireEvent::CaseFailed {
                    title,
                    message,
                    origin,
                }) => {
                    let _ = events.send(ToolEvent::CaseFailed {
                        title,
                        message,
                        origin,
                    });
                }
                Ok(WireEvent::Annotation(mut annotation)) => {
                    annotation_hook(&mut annotation);
                    annotations.push(annotation);
                }
                Ok(WireEvent::Result(s)) => {
                    stats = Some(s);
                }
                Err(err) => {
                    if line.trim_start().starts_with('{') && line.contains("\"event\"") {
                        warn!("Dropped unrecognized tool event ({err}): {line}");
                    } else {
                        // Tool chatter, not protocol.
                        debug!("tool: {}", line);
                    }
                }
            }
        }

        let stderr_buf = stderr_task.await.unwrap_or_default();
        let status = child.wait().await?;

        if !status.success() {
            return Err(ToolError::Exited {
                exit_code: status.code().unwrap_or(-1),
                stderr: stderr_buf.trim().to_string(),
            });
        }
        let stats = stats
            .ok_or_else(|| ToolError::Protocol("tool finished without a result line".to_string()))?;

        if !annotations.is_empty() {
            let path = self.work_directory.join("annotations.json");
            let body = serde_json::to_vec_pretty(&annotations)
                .map_err(|e| ToolError::Protocol(e.to_string()))?;
            tokio::fs::write(&path, body).await?;
        }

        Ok(stats)
    }
}
