use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Namespace prefix for every agent-owned environment variable. A prefixed
/// variable always wins over the bare name when both are set.
pub const ENV_PREFIX: &str = "PROBE_";

/// File name of the job descriptor inside the work directory.
pub const DESCRIPTOR_FILE: &str = "job-config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingEnv(String),
    #[error("failed to read job descriptor {path}: {source}")]
    DescriptorRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("job descriptor is not valid JSON: {0}")]
    DescriptorParse(#[from] serde_json::Error),
    #[error("job descriptor is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("more than one authentication method is specified: {}", .0.join(", "))]
    MultipleAuthMethods(Vec<String>),
    #[error("unhandled authentication method: {0}")]
    UnknownAuthMethod(String),
    #[error("authentication method '{0}' must be a string parameter")]
    BadAuthParameter(String),
}

/// Look up an environment variable, preferring the namespaced
/// `PROBE_<name>` variant over the bare name.
pub fn lookup_env(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .or_else(|_| std::env::var(name))
        .ok()
}

/// Case-insensitive walk over nested JSON object keys.
pub fn json_get<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in keys {
        let obj = current.as_object()?;
        let (_, next) = obj
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))?;
        current = next;
    }
    Some(current)
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Identity of this job run, attached to every outgoing event.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub agent_name: String,
    pub tool_name: String,
    pub task_index: String,
    pub work_directory: PathBuf,
}

/// Environment-derived agent configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AgentEnv {
    pub work_directory: PathBuf,
    pub tool_run_directory: PathBuf,
    pub job_id: String,
    pub agent_name: String,
    pub task_index: String,
    pub tool_name: String,
    /// Set when the agent runs outside the managed job backend.
    pub local: bool,
    pub broker_url: Option<String>,
    pub agent_utilities_url: Option<String>,
    pub tool_command: Option<PathBuf>,
}

impl AgentEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        let local = std::env::var("PROBE_LOCAL").map_or(false, |v| !v.is_empty());

        let required = |name: &str| {
            std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string()))
        };
        let or_local = |name: &str, fallback: &str| {
            if local {
                Ok(std::env::var(name).unwrap_or_else(|_| fallback.to_string()))
            } else {
                required(name)
            }
        };

        let work_directory = PathBuf::from(required("PROBE_WORK_DIRECTORY")?);
        let tool_run_directory = std::env::var("PROBE_TOOL_RUN_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_directory.clone());

        Ok(Self {
            job_id: or_local("PROBE_JOB_ID", "local")?,
            agent_name: or_local("PROBE_CONTAINER_NAME", "local-agent")?,
            task_index: std::env::var("PROBE_TASK_INDEX").unwrap_or_else(|_| "0".to_string()),
            tool_name: std::env::var("PROBE_TOOL_NAME")
                .unwrap_or_else(|_| "contract-runner".to_string()),
            local,
            broker_url: std::env::var("PROBE_BROKER_URL").ok(),
            agent_utilities_url: std::env::var("PROBE_AGENT_UTILITIES_URL")
                .ok()
                .map(|u| u.trim_end_matches('/').to_string()),
            tool_command: std::env::var("PROBE_TOOL_COMMAND").ok().map(PathBuf::from),
            work_directory,
            tool_run_directory,
        })
    }

    pub fn job_context(&self) -> JobContext {
        JobContext {
            job_id: self.job_id.clone(),
            agent_name: self.agent_name.clone(),
            tool_name: self.tool_name.clone(),
            task_index: self.task_index.clone(),
            work_directory: self.work_directory.clone(),
        }
    }
}

/// Target the wrapped tool tests against.
#[derive(Debug, Clone)]
pub struct TargetConfiguration {
    pub endpoint: Option<String>,
    pub api_specifications: Vec<String>,
    pub certificates_dir: Option<PathBuf>,
}

/// Per-tool overrides from the descriptor. Header lists are additive on
/// merge; scalar flags override the defaults.
#[derive(Debug, Clone, Default)]
pub struct ToolConfiguration {
    pub header: Vec<String>,
    pub dry_run: Option<bool>,
    pub only: Option<Vec<String>>,
    pub hookfiles: Option<Vec<String>>,
    pub require: Option<String>,
    pub sorted: Option<bool>,
}

impl ToolConfiguration {
    fn from_value(value: &Value) -> Self {
        Self {
            header: json_get(value, &["header"]).map(string_array).unwrap_or_default(),
            dry_run: json_get(value, &["dry-run"]).and_then(Value::as_bool),
            only: json_get(value, &["only"]).map(string_array),
            hookfiles: json_get(value, &["hookfiles"]).map(string_array),
            require: json_get(value, &["require"])
                .and_then(Value::as_str)
                .map(str::to_string),
            sorted: json_get(value, &["sorted"]).and_then(Value::as_bool),
        }
    }
}

/// The job descriptor, read once at startup and never mutated. Field lookup
/// is case-insensitive throughout.
#[derive(Debug, Clone)]
pub struct Descriptor {
    raw: Value,
}

impl Descriptor {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::DescriptorRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            raw: serde_json::from_str(&data)?,
        })
    }

    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    /// Raw `authenticationMethod` section, if any.
    pub fn auth_section(&self) -> Option<&Value> {
        json_get(&self.raw, &["authenticationMethod"])
    }

    pub fn target(&self) -> Result<TargetConfiguration, ConfigError> {
        let section = json_get(&self.raw, &["targetConfiguration"])
            .ok_or(ConfigError::MissingField("targetConfiguration"))?;
        let api_specifications = json_get(section, &["apiSpecifications"])
            .map(string_array)
            .ok_or(ConfigError::MissingField("apiSpecifications"))?;
        Ok(TargetConfiguration {
            endpoint: json_get(section, &["endpoint"])
                .and_then(Value::as_str)
                .map(str::to_string),
            api_specifications,
            certificates_dir: json_get(section, &["certificates"])
                .and_then(Value::as_str)
                .map(PathBuf::from),
        })
    }

    pub fn tool_overrides(&self) -> Option<ToolConfiguration> {
        json_get(&self.raw, &["toolConfiguration"]).map(ToolConfiguration::from_value)
    }
}
