//! reqwest-backed transport.

use super::{Address, Transport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use std::sync::RwLock;
use std::time::Duration;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    client: reqwest::Client,
    address: RwLock<Address>,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(address: Address, user_agent: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.clone())
            .build()?;

        Ok(HttpTransport {
            client,
            address: RwLock::new(address),
            user_agent,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn set_address(&self, address: Address) {
        debug!("Transport address set to {}", address.base_url());
        match self.address.write() {
            Ok(mut current) => *current = address,
            Err(poisoned) => *poisoned.into_inner() = address,
        }
    }

    fn address(&self) -> Address {
        match self.address.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn post(&self, path: &str, body: String) -> Result<()> {
        let url = self.address().url_for(path);

        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Request to {url} timed out")
                } else if e.is_connect() {
                    anyhow!("Could not connect to {url}")
                } else {
                    anyhow!("HTTP request failed: {e}")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Endpoint returned HTTP {status}"));
        }
        Ok(())
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }
}
