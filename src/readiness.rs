use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `url` until it answers 200 OK. Deliberately unbounded: startup has
/// no other path forward, and the surrounding orchestration terminates the
/// container on its own timeout if readiness never comes.
pub async fn wait_until_ready(url: &str) {
    wait_with_interval(&reqwest::Client::new(), url, POLL_INTERVAL).await;
}

pub(crate) async fn wait_with_interval(client: &reqwest::Client, url: &str, interval: Duration) {
    info!("Waiting for {} to become ready", url);
    loop {
        match client.get(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                info!("{} is ready", url);
                return;
            }
            Ok(response) => {
                debug!("Readiness probe returned {}, retrying", response.status());
            }
            Err(err) => {
                debug!("Readiness probe failed ({}), retrying", err);
            }
        }
        tokio::time::sleep(interval).await;
    }
}
