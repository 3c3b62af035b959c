use std::time::Duration;

use crate::error::{Error, Result};

/// Hard cap on followed redirects, regardless of template settings.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

const POOL_IDLE_TIMEOUT_SECS: u64 = 3;

/// Per-request connection policy, derived from template flags.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout_secs: u64,
    pub follow_redirects: bool,
    /// 0 means "no template override"; the hard cap still applies.
    pub max_redirects: usize,
    pub cookie_reuse: bool,
}

/// Build the blocking client for one compiled request.
///
/// Certificate verification is off: scan targets routinely present
/// self-signed or expired certificates. Connections are pooled one-per-host
/// with a short idle timeout.
pub fn create_client(config: &ClientConfig) -> Result<reqwest::blocking::Client> {
    let redirect = if config.follow_redirects {
        let cap = if config.max_redirects == 0 {
            DEFAULT_MAX_REDIRECTS
        } else {
            config.max_redirects.min(DEFAULT_MAX_REDIRECTS)
        };
        reqwest::redirect::Policy::limited(cap)
    } else {
        reqwest::redirect::Policy::none()
    };

    reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.timeout_secs))
        .redirect(redirect)
        .pool_max_idle_per_host(1)
        .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
        .cookie_store(config.cookie_reuse)
        .build()
        .map_err(|e| Error::Dial(format!("could not build http client: {e}")))
}
