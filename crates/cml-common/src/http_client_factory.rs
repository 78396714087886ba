// HttpClientFactory: builds the reqwest client used by every driver.

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

/// Environment variable that disables TLS certificate verification.
const TLS_NO_VERIFY: &str = "CML_TLS_NO_VERIFY";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Create a `reqwest::Client` with the given user agent.
    ///
    /// Proxies are taken from `HTTP(S)_PROXY` / `NO_PROXY` by reqwest itself.
    /// When `CML_TLS_NO_VERIFY` is truthy, certificate verification is off.
    pub fn create_client(user_agent: &str) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(user_agent)
            .timeout(REQUEST_TIMEOUT)
            .gzip(true);

        if let Ok(val) = std::env::var(TLS_NO_VERIFY) {
            if cml_sdk::StringUtil::convert_to_bool(&val) == Some(true) {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder.build().context("Failed to build HTTP client")
    }
}
