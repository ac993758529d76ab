//! HTTP Transport
//!
//! Builds the shared reqwest client used by all workers, applying the
//! configured request timeout, proxy and redirect policy.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{TaskError, TaskResult};

/// User agent sent on every request.
const USER_AGENT: &str = concat!("ferry/", env!("CARGO_PKG_VERSION"));

/// Redirect hop limit.
const MAX_REDIRECTS: usize = 10;

/// Build the engine-wide HTTP client from configuration.
///
/// The connect timeout comes from `request_timeout`; the overall per-request
/// deadline is left open because transfers are long-lived and are bounded by
/// the worker-level resource timeout instead.
pub fn build_client(config: &EngineConfig) -> TaskResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(config.request_timeout())
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Duration::from_secs(30));

    if let Some(proxy) = &config.proxy {
        let proxy_url = format!("http://{}:{}", proxy.address, proxy.port);
        builder = builder.proxy(
            reqwest::Proxy::all(&proxy_url)
                .map_err(|e| TaskError::General(format!("invalid proxy {proxy_url}: {e}")))?,
        );
    } else {
        builder = builder.no_proxy();
    }

    // Debug builds only; release builds always validate certificates.
    #[cfg(debug_assertions)]
    if config.bypass_tls_certificate_validation {
        tracing::warn!("TLS certificate validation disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| TaskError::General(format!("cannot build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    #[test]
    fn test_build_default() {
        let client = build_client(&EngineConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn test_build_with_proxy() {
        let config = EngineConfig {
            proxy: Some(ProxyConfig {
                address: "127.0.0.1".to_string(),
                port: 3128,
            }),
            ..Default::default()
        };
        assert!(build_client(&config).is_ok());
    }
}
