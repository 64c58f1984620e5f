//! Runtime configuration and secrets loading.
//!
//! Timing knobs default to values that satisfy the component contracts
//! (sweep period below the session timeout, session timeout above the
//! host's progress cadence); the secrets file contributes only the
//! sensitive parts: gateway tokens and the media-server credentials.

use std::collections::HashMap;
use std::time::Duration;
use std::{fs, io};

use serde::Deserialize;
use thiserror::Error;
use url::Url;
use veil::Redact;

use crate::media::UserId;
use crate::protocol::frames::ClientProperties;
use crate::tokens::{TokenError, UserToken};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("reading secrets failed: {0}")]
    Io(#[from] io::Error),

    #[error("secrets format invalid: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Token(#[from] TokenError),

    #[error("assertion failed: {0}")]
    Assertion(String),
}

/// Media-server endpoint the host poller talks to.
#[derive(Clone, Redact)]
pub struct HostSettings {
    /// Base URL of the media server.
    pub url: Url,

    /// API key sent on every request.
    #[redact]
    pub api_key: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Language code for metadata scraping.
    pub language: String,

    /// Client properties declared on IDENTIFY.
    pub properties: ClientProperties,

    /// Well-known gateway URL used for fresh handshakes.
    pub gateway_url: Url,

    /// Position discrepancy treated as a seek/rewind.
    pub drift_tolerance: Duration,

    /// Sweeper cadence.
    pub sweep_interval: Duration,

    /// Inactivity after which a session is reclaimed.
    pub session_timeout: Duration,

    /// Cooldown before reconnecting after a server-signaled invalid
    /// session.
    pub invalid_session_cooldown: Duration,

    /// Base delay before retrying a failed gateway connect.
    pub connect_retry_delay: Duration,

    /// Host poll cadence.
    pub poll_interval: Duration,

    /// Media-server endpoint, when the secrets file configures one.
    pub host: Option<HostSettings>,

    /// Gateway token per tracked user.
    pub tokens: HashMap<UserId, UserToken>,
}

/// On-disk shape of the secrets file.
#[derive(Deserialize, Redact)]
struct Secrets {
    server_url: Option<Url>,
    #[redact]
    api_key: Option<String>,
    #[serde(default)]
    #[redact]
    tokens: HashMap<UserId, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: env!("CARGO_PKG_NAME").to_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            language: "en".to_owned(),
            properties: ClientProperties::default(),
            gateway_url: Url::parse(Self::WELL_KNOWN_GATEWAY).expect("invalid gateway url"),
            drift_tolerance: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            session_timeout: Duration::from_secs(75),
            invalid_session_cooldown: Duration::from_secs(3),
            connect_retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            host: None,
            tokens: HashMap::new(),
        }
    }
}

impl Config {
    /// The well-known presence gateway.
    pub const WELL_KNOWN_GATEWAY: &'static str = "wss://gateway.discord.gg";

    /// Largest secrets file accepted, to prevent out-of-memory conditions
    /// on a mistyped path.
    const MAX_SECRETS_SIZE: u64 = 64 * 1024;

    /// Builds a configuration from defaults plus a secrets file.
    pub fn from_secrets(secrets_file: &str) -> Result<Self> {
        let mut config = Self::default();
        config.load_secrets(secrets_file)?;
        Ok(config)
    }

    /// Merges a secrets file into this configuration.
    pub fn load_secrets(&mut self, secrets_file: &str) -> Result<()> {
        let attributes = fs::metadata(secrets_file)?;
        if attributes.len() > Self::MAX_SECRETS_SIZE {
            return Err(Error::Assertion(format!("{secrets_file} is too large")));
        }

        let contents = fs::read_to_string(secrets_file)?;
        let secrets: Secrets = toml::from_str(&contents)?;

        match (secrets.server_url, secrets.api_key) {
            (Some(url), Some(api_key)) => self.host = Some(HostSettings { url, api_key }),
            (None, None) => {}
            _ => {
                return Err(Error::Assertion(format!(
                    "{secrets_file} must set server_url and api_key together"
                )));
            }
        }

        for (user_id, token) in secrets.tokens {
            self.tokens.insert(user_id, UserToken::new(&token)?);
        }
        debug!("gateway tokens configured for {} user(s)", self.tokens.len());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_secrets(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_satisfy_component_contracts() {
        let config = Config::default();
        assert!(config.sweep_interval < config.session_timeout);
        assert!(config.poll_interval < config.session_timeout);
        assert_eq!(config.gateway_url.scheme(), "wss");
    }

    #[test]
    fn secrets_parse_tokens_and_host() {
        let file = write_secrets(
            r#"
            server_url = "http://media.local:8096/"
            api_key = "host-key"

            [tokens]
            "6c5a2f1e-aaaa-bbbb-cccc-0123456789ab" = "gateway-token"
            "#,
        );
        let config = Config::from_secrets(file.path().to_str().unwrap()).unwrap();

        let host = config.host.as_ref().unwrap();
        assert_eq!(host.url.as_str(), "http://media.local:8096/");
        assert_eq!(host.api_key, "host-key");

        let user: UserId = "6c5a2f1e-aaaa-bbbb-cccc-0123456789ab".parse().unwrap();
        assert_eq!(
            config.tokens.get(&user).map(UserToken::expose),
            Some("gateway-token")
        );
    }

    #[test]
    fn tokens_alone_are_acceptable() {
        let file = write_secrets(
            r#"
            [tokens]
            "6c5a2f1e-aaaa-bbbb-cccc-0123456789ab" = "gateway-token"
            "#,
        );
        let config = Config::from_secrets(file.path().to_str().unwrap()).unwrap();
        assert!(config.host.is_none());
        assert_eq!(config.tokens.len(), 1);
    }

    #[test]
    fn host_settings_must_be_complete() {
        let file = write_secrets(r#"server_url = "http://media.local:8096/""#);
        assert!(Config::from_secrets(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let file = write_secrets(
            r#"
            [tokens]
            "6c5a2f1e-aaaa-bbbb-cccc-0123456789ab" = ""
            "#,
        );
        assert!(Config::from_secrets(file.path().to_str().unwrap()).is_err());
    }
}
