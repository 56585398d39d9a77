//! Public/egress IP detection.

use std::net::SocketAddr;
use std::time::Duration;

const CHECK_IP_URL: &str = "https://checkip.amazonaws.com";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// The controller's own public IP, as seen by the checkip endpoint.
pub async fn detect_public_ip(client: &reqwest::Client) -> anyhow::Result<String> {
    let body = client
        .get(CHECK_IP_URL)
        .timeout(LOOKUP_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body.trim().to_string())
}

/// The egress IP observed through the forwarder, i.e. through whichever
/// live tunnel the round-robin hands the lookup to.
pub async fn egress_ip_via(forwarder: SocketAddr) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{forwarder}"))?)
        .timeout(LOOKUP_TIMEOUT)
        .build()?;
    detect_public_ip(&client).await
}
