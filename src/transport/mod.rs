//! # Transport
//!
//! Asynchronous delivery of a single hit to the collection endpoint.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0

pub mod http;
pub mod user_agent;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpTransport;
pub use user_agent::create_user_agent_string;

/// Default collection host
pub const DEFAULT_HOST: &str = "www.google-analytics.com";

/// Fixed port for plain HTTP
pub const HTTP_PORT: u16 = 80;

/// Fixed port for HTTPS
pub const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Where hits are POSTed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Address {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }

    /// Full URL for a path such as `/collect`
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}

/// Sends hits over the network.
///
/// A send resolves to `Ok` only when the endpoint accepted the request.
/// Timeouts are the transport's responsibility; the dispatcher never
/// abandons a send on its own while running.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Point subsequent sends at `address`. Sends already started keep the
    /// address they were started with.
    fn set_address(&self, address: Address);

    fn address(&self) -> Address;

    /// POST `body` to `path` on the current address
    async fn post(&self, path: &str, body: String) -> Result<()>;

    fn user_agent(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_urls() {
        let address = Address::new(Scheme::Https, "example.com", HTTPS_PORT);

        assert_eq!(address.base_url(), "https://example.com:443");
        assert_eq!(address.url_for("/collect"), "https://example.com:443/collect");
        assert_eq!(address.url_for("collect"), "https://example.com:443/collect");
    }
}
