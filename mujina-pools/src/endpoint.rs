//! Pool endpoint descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::Algorithm;

/// How a session authenticates with the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
    /// Single `login` request carrying credentials and the algorithm list.
    /// The response contains the first job.
    #[default]
    Login,

    /// Classic Stratum `mining.subscribe` followed by `mining.authorize`.
    SubscribeAuthorize,
}

/// Immutable description of a remote job-issuing endpoint.
///
/// Fields are private; build with [`Endpoint::new`] or [`Endpoint::parse`]
/// and the `with_*` methods, then treat the value as read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    #[serde(default)]
    user: String,
    #[serde(default = "default_password")]
    password: String,
    /// Alternate credential used in direct-login mode when present
    #[serde(default)]
    spare_user: Option<String>,
    #[serde(default)]
    rig_id: Option<String>,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    mode: LoginMode,
    #[serde(default = "default_enabled")]
    enabled: bool,
    /// Algorithm forced for this endpoint, if any
    #[serde(default)]
    algorithm: Option<Algorithm>,
}

fn default_password() -> String {
    "x".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: String::new(),
            password: default_password(),
            spare_user: None,
            rig_id: None,
            tls: false,
            mode: LoginMode::Login,
            enabled: true,
            algorithm: None,
        }
    }

    /// Parse a pool URL.
    ///
    /// Accepts `stratum+tcp://`, `tcp://`, `stratum+ssl://`, `stratum+tls://`
    /// or no scheme at all. The TLS schemes set the TLS flag.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        let (rest, tls) = if let Some(rest) = url.strip_prefix("stratum+tcp://") {
            (rest, false)
        } else if let Some(rest) = url.strip_prefix("tcp://") {
            (rest, false)
        } else if let Some(rest) = url
            .strip_prefix("stratum+ssl://")
            .or_else(|| url.strip_prefix("stratum+tls://"))
        {
            (rest, true)
        } else if url.contains("://") {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        } else {
            (url, false)
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidUrl(url.to_string()))?;

        if host.is_empty() {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
        if port == 0 {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }

        Ok(Self::new(host, port).with_tls(tls))
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_spare_user(mut self, user: impl Into<String>) -> Self {
        self.spare_user = Some(user.into());
        self
    }

    pub fn with_rig_id(mut self, rig_id: impl Into<String>) -> Self {
        self.rig_id = Some(rig_id.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_mode(mut self, mode: LoginMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn rig_id(&self) -> Option<&str> {
        self.rig_id.as_deref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn mode(&self) -> LoginMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn algorithm(&self) -> Option<&Algorithm> {
        self.algorithm.as_ref()
    }

    /// Credential presented to the pool for this endpoint's login mode.
    pub fn login_user(&self) -> &str {
        match (self.mode, &self.spare_user) {
            (LoginMode::Login, Some(spare)) => spare,
            _ => &self.user,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full URL with a scheme reflecting the TLS flag.
    pub fn url(&self) -> String {
        self.url_with_tls(self.tls)
    }

    pub fn url_with_tls(&self, tls: bool) -> String {
        let scheme = if tls { "stratum+ssl" } else { "stratum+tcp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_schemes() {
        let ep = Endpoint::parse("stratum+tcp://pool.example.com:3333").unwrap();
        assert_eq!(ep.host(), "pool.example.com");
        assert_eq!(ep.port(), 3333);
        assert!(!ep.is_tls());

        let ep = Endpoint::parse("stratum+ssl://pool.example.com:443").unwrap();
        assert!(ep.is_tls());

        let ep = Endpoint::parse("pool.example.com:3333").unwrap();
        assert_eq!(ep.address(), "pool.example.com:3333");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Endpoint::parse("http://pool:80").is_err());
        assert!(Endpoint::parse("pool.example.com").is_err());
        assert!(Endpoint::parse(":3333").is_err());
        assert!(Endpoint::parse("pool:notaport").is_err());
        assert!(Endpoint::parse("pool:0").is_err());
    }

    #[test]
    fn login_user_prefers_spare_in_login_mode() {
        let ep = Endpoint::new("pool", 3333)
            .with_credentials("main", "x")
            .with_spare_user("alt");
        assert_eq!(ep.login_user(), "alt");

        let ep = ep.with_mode(LoginMode::SubscribeAuthorize);
        assert_eq!(ep.login_user(), "main");
    }

    #[test]
    fn url_reflects_tls() {
        let ep = Endpoint::new("pool", 3333);
        assert_eq!(ep.url(), "stratum+tcp://pool:3333");
        assert_eq!(ep.url_with_tls(true), "stratum+ssl://pool:3333");
    }

    #[test]
    fn deserialize_with_defaults() {
        let ep: Endpoint =
            serde_json::from_str(r#"{"host": "pool", "port": 3333, "user": "w"}"#).unwrap();
        assert_eq!(ep.password(), "x");
        assert!(ep.is_enabled());
        assert_eq!(ep.mode(), LoginMode::Login);
    }
}
