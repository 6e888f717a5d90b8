//! Client configuration.

use std::time::Duration;

use common::{Error, Result};
use url::Url;

/// Configuration for the realtime feed client.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Feed endpoint. Resolved from `FEED_WS_URL` when absent.
    pub url: Option<Url>,
    /// Base delay between reconnection attempts.
    pub reconnect_interval: Duration,
    /// Attempts allowed before giving up until the next manual connect.
    pub max_reconnect_attempts: u32,
    /// Interval between liveness pings while connected.
    pub heartbeat_interval: Duration,
    /// Credential presented as a `token` query parameter.
    pub auth_token: Option<String>,
    /// Update-interval hint forwarded in subscribe messages.
    pub update_interval: Option<Duration>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_interval: Duration::from_millis(5000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_millis(30000),
            auth_token: None,
            update_interval: None,
        }
    }
}

impl FeedConfig {
    /// Build a config from the environment (`FEED_WS_URL`, `FEED_AUTH_TOKEN`).
    pub fn from_env() -> Self {
        let url = std::env::var("FEED_WS_URL")
            .ok()
            .and_then(|raw| Url::parse(&raw).ok());
        let auth_token = std::env::var("FEED_AUTH_TOKEN").ok();
        Self {
            url,
            auth_token,
            ..Self::default()
        }
    }

    /// The URL to dial, with the auth token appended when configured.
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = self.url.clone().ok_or(Error::MissingUrl)?;
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FeedConfig::default();
        assert_eq!(config.reconnect_interval, Duration::from_millis(5000));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30000));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_connect_url_appends_token() {
        let config = FeedConfig {
            url: Some(Url::parse("wss://feed.example.com/ws").unwrap()),
            auth_token: Some("s3cret".to_string()),
            ..FeedConfig::default()
        };
        let url = config.connect_url().unwrap();
        assert_eq!(url.as_str(), "wss://feed.example.com/ws?token=s3cret");
    }

    #[test]
    fn test_connect_url_requires_url() {
        let config = FeedConfig::default();
        assert!(matches!(config.connect_url(), Err(Error::MissingUrl)));
    }
}
