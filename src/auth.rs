use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, lookup_env};

const DEFAULT_IDENTITY_HOST: &str = "https://login.microsoftonline.com";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token environment variable is not set: {0}")]
    MissingVariable(String),
    #[error("authentication parameters in {variable} are not valid JSON: {source}")]
    BadParameters {
        variable: String,
        source: serde_json::Error,
    },
    #[error("identity provider rejected the token request: {error} {description}")]
    IdentityProvider { error: String, description: String },
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token command exited with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },
    #[error("failed to run token command: {0}")]
    CommandSpawn(std::io::Error),
    #[error("auth relay returned HTTP {0}")]
    Relay(reqwest::StatusCode),
}

/// Declarative authentication method from the job descriptor. The descriptor
/// must name exactly one; zero methods means no `Authorization` header.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthSpec {
    /// Client-credentials exchange; the env var holds the JSON parameters.
    Msal { env_var: String },
    /// A ready-made token in an environment variable.
    TxtToken { env_var: String },
    /// A shell command whose stdout is the token.
    CommandLine { command: String },
}

impl AuthSpec {
    /// Parse the descriptor's `authenticationMethod` section. Returns
    /// `Ok(None)` when no method is configured; more than one named method
    /// is a configuration error surfaced before any network activity.
    pub fn from_descriptor(section: Option<&Value>) -> Result<Option<Self>, ConfigError> {
        let Some(obj) = section.and_then(Value::as_object) else {
            return Ok(None);
        };
        if obj.is_empty() {
            return Ok(None);
        }
        if obj.len() > 1 {
            return Err(ConfigError::MultipleAuthMethods(
                obj.keys().cloned().collect(),
            ));
        }
        let Some((method, param)) = obj.iter().next() else {
            return Ok(None);
        };
        let param = param
            .as_str()
            .ok_or_else(|| ConfigError::BadAuthParameter(method.clone()))?
            .to_string();
        match method.to_lowercase().as_str() {
            "msal" => Ok(Some(Self::Msal { env_var: param })),
            "txttoken" => Ok(Some(Self::TxtToken { env_var: param })),
            "commandline" => Ok(Some(Self::CommandLine { command: param })),
            _ => Err(ConfigError::UnknownAuthMethod(method.clone())),
        }
    }
}

/// Resolved `Authorization` header material. Absence of a token (no auth
/// configured) is distinct from failure and handled by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenResult {
    pub scheme: Option<String>,
    pub value: String,
}

impl TokenResult {
    pub fn header_value(&self) -> String {
        match &self.scheme {
            Some(scheme) => format!("{scheme} {}", self.value),
            None => self.value.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MsalParams {
    client: String,
    tenant: String,
    secret: String,
    scopes: Option<Vec<String>>,
    #[serde(rename = "authorityUri")]
    authority_uri: Option<String>,
    audience: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityTokenResponse {
    token_type: Option<String>,
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelayTokenResponse {
    token: String,
}

/// Resolves a declarative [`AuthSpec`] into an `Authorization` header value.
///
/// When a sidecar base URL is configured the MSAL path is relayed through it
/// instead of contacting the identity provider directly, for topologies
/// where the agent holds no provider credentials.
pub struct AuthResolver {
    http: reqwest::Client,
    sidecar_base: Option<String>,
}

impl AuthResolver {
    pub fn new(sidecar_base: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            sidecar_base,
        }
    }

    pub async fn resolve(&self, spec: &AuthSpec) -> Result<TokenResult, AuthError> {
        match spec {
            AuthSpec::Msal { env_var } => self.resolve_msal(env_var).await,
            AuthSpec::TxtToken { env_var } => {
                let value = lookup_env(env_var)
                    .ok_or_else(|| AuthError::MissingVariable(env_var.clone()))?;
                Ok(TokenResult {
                    scheme: None,
                    value,
                })
            }
            AuthSpec::CommandLine { command } => self.resolve_command(command).await,
        }
    }

    async fn resolve_msal(&self, env_var: &str) -> Result<TokenResult, AuthError> {
        if let Some(base) = &self.sidecar_base {
            return self.resolve_via_relay(base, env_var).await;
        }

        let raw =
            lookup_env(env_var).ok_or_else(|| AuthError::MissingVariable(env_var.to_string()))?;
        let params: MsalParams =
            serde_json::from_str(&raw).map_err(|source| AuthError::BadParameters {
                variable: env_var.to_string(),
                source,
            })?;

        let authority = format!(
            "{}/{}",
            params
                .authority_uri
                .as_deref()
                .unwrap_or(DEFAULT_IDENTITY_HOST),
            params.tenant
        );
        let scopes = params.scopes.unwrap_or_else(|| {
            let resource = params.audience.as_deref().unwrap_or(&params.client);
            vec![format!("{resource}/.default")]
        });

        info!("Requesting client-credentials token from {}", authority);
        let response = self
            .http
            .post(format!("{authority}/oauth2/v2.0/token"))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &params.client),
                ("client_secret", &params.secret),
                ("scope", &scopes.join(" ")),
            ])
            .send()
            .await?;
        let token: IdentityTokenResponse = response.json().await?;

        if let Some(error) = token.error {
            return Err(AuthError::IdentityProvider {
                error,
                description: token.error_description.unwrap_or_default(),
            });
        }
        match token.access_token {
            Some(value) => Ok(TokenResult {
                scheme: token.token_type,
                value,
            }),
            None => Err(AuthError::IdentityProvider {
                error: "invalid_response".to_string(),
                description: "no access_token in provider response".to_string(),
            }),
        }
    }

    async fn resolve_via_relay(&self, base: &str, env_var: &str) -> Result<TokenResult, AuthError> {
        info!("Resolving MSAL token through the agent utilities relay");
        let response = self
            .http
            .get(format!("{base}/auth/msal/{env_var}"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Relay(response.status()));
        }
        let relayed: RelayTokenResponse = response.json().await?;
        Ok(TokenResult {
            scheme: None,
            value: relayed.token,
        })
    }

    async fn resolve_command(&self, command: &str) -> Result<TokenResult, AuthError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(AuthError::CommandSpawn)?;
        if !output.status.success() {
            return Err(AuthError::CommandFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(TokenResult {
            scheme: None,
            value: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        })
    }
}
