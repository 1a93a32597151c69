use std::time::Duration;

use waveproxy_core::error::ProxyError;

/// Per-attempt deadline for generation requests. Failing over to the next
/// channel starts a fresh deadline.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(300);
/// Per-attempt deadline for model listing/detail requests.
pub const LISTING_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for a control-plane channel ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The one shared upstream client; its connection pool is reused across all
/// requests. Per-request deadlines are applied on the request builder.
pub fn build_http_client() -> Result<reqwest::Client, ProxyError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))
}
