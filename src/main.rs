mod adapter;
mod auth;
mod certs;
mod config;
mod readiness;
mod runner;
mod transport;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::adapter::{AgentState, ToolAdapter};
use crate::auth::AuthResolver;
use crate::certs::CertificateInstaller;
use crate::config::{AgentEnv, DESCRIPTOR_FILE, Descriptor};
use crate::runner::ProcessRunner;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(AgentState::Completed) => {}
        Ok(state) => {
            error!("Job ended in state {:?}", state);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Agent failed to start: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<AgentState> {
    let env = AgentEnv::from_env()?;
    let ctx = env.job_context();
    info!(
        "Starting {} for job {} (agent {}, task {})",
        ctx.tool_name, ctx.job_id, ctx.agent_name, ctx.task_index
    );

    let descriptor = Descriptor::load(&env.work_directory.join(DESCRIPTOR_FILE))?;
    let transport = transport::from_env(&env, ctx.clone()).await?;

    // The relay must be up before anything is reported through it.
    if let Some(base) = &env.agent_utilities_url {
        readiness::wait_until_ready(&format!("{base}/readiness/ready")).await;
    }

    let adapter = ToolAdapter::new(
        ctx,
        descriptor,
        transport,
        AuthResolver::new(env.agent_utilities_url.clone()),
        CertificateInstaller::default(),
        Box::new(ProcessRunner::from_env(&env)),
    );
    Ok(adapter.run().await)
}
