//! Pool configuration.
//!
//! Settings come from `MUJINA_*` environment variables and are validated
//! once, here, so the strategies can assume a well-formed configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoint, LoginMode};
use crate::error::ConfigError;
use crate::job::Algorithm;

/// Whether the auxiliary session may ride on the primary connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Always open a separate connection
    Disabled,

    /// Tunnel when the primary pool advertises the `connect` extension
    #[default]
    Auto,
}

/// Auxiliary session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryConfig {
    /// Share of time, in percent, the auxiliary session is active (1-99)
    pub level: u8,

    pub endpoints: Vec<Endpoint>,

    pub tunnel: TunnelMode,

    /// Shorten every duration, counting seconds instead of minutes
    pub test_mode: bool,

    /// Failover retries for the auxiliary endpoint list
    pub retries: u32,

    pub retry_pause: Duration,

    /// Bounds of the random factor applied to the first idle period
    pub first_idle_jitter: (f64, f64),

    /// Bounds of the random factor applied to later idle periods
    pub idle_jitter: (f64, f64),

    /// Delay before trying again after a failed activation
    pub connect_retry_delay: Duration,

    /// Grace period after the active period ends, for in-flight results
    pub wait_window: Duration,

    /// Consecutive tunnel failures that trigger fallback to own connections
    pub tunnel_failure_threshold: u32,

    /// Seed for the timing jitter. Random when unset.
    pub seed: Option<u64>,
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            level: 1,
            endpoints: Vec::new(),
            tunnel: TunnelMode::Auto,
            test_mode: false,
            retries: 2,
            retry_pause: Duration::from_secs(1),
            first_idle_jitter: (0.5, 1.5),
            idle_jitter: (0.8, 1.2),
            connect_retry_delay: Duration::from_secs(20),
            wait_window: Duration::from_secs(3),
            tunnel_failure_threshold: 2,
            seed: None,
        }
    }
}

impl AuxiliaryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=99).contains(&self.level) {
            return Err(ConfigError::LevelOutOfRange(self.level));
        }

        if !self.endpoints.iter().any(Endpoint::is_enabled) {
            return Err(ConfigError::NoEndpoints);
        }

        for (min, max) in [self.first_idle_jitter, self.idle_jitter] {
            if !(min > 0.0 && min <= max && max.is_finite()) {
                return Err(ConfigError::InvalidJitter { min, max });
            }
        }

        Ok(())
    }

    fn unit(&self) -> Duration {
        if self.test_mode {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(60)
        }
    }

    /// Length of each active period.
    pub fn active_duration(&self) -> Duration {
        self.unit() * u32::from(self.level)
    }

    /// Nominal length of each idle period, before jitter.
    pub fn idle_duration(&self) -> Duration {
        self.unit() * (100 - u32::from(self.level.min(100)))
    }

    // Fixed delays shrink by the same factor as the cycle periods.
    fn scaled(&self, delay: Duration) -> Duration {
        if self.test_mode { delay / 60 } else { delay }
    }

    pub fn connect_retry_delay(&self) -> Duration {
        self.scaled(self.connect_retry_delay)
    }

    pub fn wait_window(&self) -> Duration {
        self.scaled(self.wait_window)
    }

    pub fn retry_pause(&self) -> Duration {
        self.scaled(self.retry_pause)
    }
}

/// Everything the pool manager needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub endpoints: Vec<Endpoint>,

    pub retries: u32,

    pub retry_pause: Duration,

    /// Algorithms this miner can run, in order of preference
    pub algorithms: Vec<Algorithm>,

    /// Client identification sent at login
    pub agent: String,

    pub auxiliary: Option<AuxiliaryConfig>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            retries: 5,
            retry_pause: Duration::from_secs(5),
            algorithms: vec![Algorithm::new("rx/0")],
            agent: format!("mujina-pools/{}", env!("CARGO_PKG_VERSION")),
            auxiliary: None,
        }
    }
}

impl PoolsConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to read variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = PoolsConfig::default();

        let urls = lookup("MUJINA_POOL_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("MUJINA_POOL_URL".into()))?;
        let user = lookup("MUJINA_POOL_USER").unwrap_or_default();
        let pass = lookup("MUJINA_POOL_PASS").unwrap_or_else(|| "x".into());
        let mode = parse_mode(&lookup, "MUJINA_POOL_MODE")?;
        let pinned = lookup("MUJINA_POOL_ALGO")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(Algorithm::new);
        config.endpoints = parse_endpoints(&urls, &user, &pass)?
            .into_iter()
            .map(|endpoint| {
                let endpoint = endpoint.with_mode(mode);
                match &pinned {
                    Some(algorithm) => endpoint.with_algorithm(algorithm.clone()),
                    None => endpoint,
                }
            })
            .collect();

        if let Some(v) = lookup("MUJINA_POOL_RETRIES") {
            config.retries = parse_number("MUJINA_POOL_RETRIES", &v)?;
        }
        if let Some(v) = lookup("MUJINA_POOL_RETRY_PAUSE_SECS") {
            config.retry_pause =
                Duration::from_secs(parse_number("MUJINA_POOL_RETRY_PAUSE_SECS", &v)?);
        }
        if let Some(v) = lookup("MUJINA_ALGORITHMS") {
            let algorithms: Vec<Algorithm> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Algorithm::new)
                .collect();
            if algorithms.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "MUJINA_ALGORITHMS".into(),
                    value: v,
                });
            }
            config.algorithms = algorithms;
        }

        if let Some(level) = lookup("MUJINA_AUX_LEVEL") {
            let level: u8 = parse_number("MUJINA_AUX_LEVEL", &level)?;
            if level > 0 {
                let urls = lookup("MUJINA_AUX_URL")
                    .ok_or_else(|| ConfigError::Missing("MUJINA_AUX_URL".into()))?;
                let user = lookup("MUJINA_AUX_USER").unwrap_or_default();
                let mode = parse_mode(&lookup, "MUJINA_AUX_MODE")?;

                let mut aux = AuxiliaryConfig {
                    level,
                    endpoints: parse_endpoints(&urls, &user, "x")?
                        .into_iter()
                        .map(|endpoint| endpoint.with_mode(mode))
                        .collect(),
                    ..Default::default()
                };

                if let Some(v) = lookup("MUJINA_AUX_TUNNEL") {
                    aux.tunnel = match v.trim().to_ascii_lowercase().as_str() {
                        "none" | "disabled" => TunnelMode::Disabled,
                        "auto" => TunnelMode::Auto,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                key: "MUJINA_AUX_TUNNEL".into(),
                                value: v,
                            });
                        }
                    };
                }

                aux.test_mode = lookup("MUJINA_TEST_MODE").is_some_and(|v| is_truthy(&v));
                config.auxiliary = Some(aux);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoints.iter().any(Endpoint::is_enabled) {
            return Err(ConfigError::NoEndpoints);
        }
        if let Some(aux) = &self.auxiliary {
            aux.validate()?;
        }
        Ok(())
    }
}

fn parse_endpoints(urls: &str, user: &str, pass: &str) -> Result<Vec<Endpoint>, ConfigError> {
    urls.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|url| Endpoint::parse(url).map(|e| e.with_credentials(user, pass)))
        .collect()
}

/// `login` (default) or `subscribe` for classic Stratum v1 pools.
fn parse_mode(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<LoginMode, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(LoginMode::Login);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "login" => Ok(LoginMode::Login),
        "subscribe" | "stratum" => Ok(LoginMode::SubscribeAuthorize),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn minimal_environment() {
        let config =
            PoolsConfig::from_lookup(lookup(&[("MUJINA_POOL_URL", "stratum+tcp://pool:3333")]))
                .unwrap();

        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].password(), "x");
        assert_eq!(config.retries, 5);
        assert!(config.auxiliary.is_none());
    }

    #[test]
    fn pool_url_is_required() {
        let err = PoolsConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("MUJINA_POOL_URL".into()));
    }

    #[test]
    fn full_environment() {
        let config = PoolsConfig::from_lookup(lookup(&[
            ("MUJINA_POOL_URL", "a:1, stratum+ssl://b:2"),
            ("MUJINA_POOL_USER", "wallet"),
            ("MUJINA_POOL_RETRIES", "3"),
            ("MUJINA_POOL_RETRY_PAUSE_SECS", "10"),
            ("MUJINA_ALGORITHMS", "rx/0,cn/r"),
            ("MUJINA_AUX_LEVEL", "5"),
            ("MUJINA_AUX_URL", "aux:3333"),
            ("MUJINA_AUX_TUNNEL", "none"),
            ("MUJINA_TEST_MODE", "1"),
        ]))
        .unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints[1].is_tls());
        assert_eq!(config.endpoints[0].user(), "wallet");
        assert_eq!(config.retries, 3);
        assert_eq!(config.retry_pause, Duration::from_secs(10));
        assert_eq!(config.algorithms, vec![Algorithm::new("rx/0"), Algorithm::new("cn/r")]);

        let aux = config.auxiliary.unwrap();
        assert_eq!(aux.level, 5);
        assert_eq!(aux.tunnel, TunnelMode::Disabled);
        assert_eq!(aux.active_duration(), Duration::from_secs(5));
        assert_eq!(aux.idle_duration(), Duration::from_secs(95));
    }

    #[test]
    fn durations_in_minutes_outside_test_mode() {
        let aux = AuxiliaryConfig {
            level: 2,
            ..Default::default()
        };
        assert_eq!(aux.active_duration(), Duration::from_secs(120));
        assert_eq!(aux.idle_duration(), Duration::from_secs(98 * 60));
    }

    #[test]
    fn test_mode_shortens_fixed_delays() {
        let aux = AuxiliaryConfig {
            level: 1,
            test_mode: true,
            ..Default::default()
        };
        assert_eq!(aux.active_duration(), Duration::from_secs(1));
        assert!(aux.connect_retry_delay() < aux.active_duration());
        assert_eq!(aux.connect_retry_delay(), Duration::from_secs(20) / 60);
        assert_eq!(aux.wait_window(), Duration::from_millis(50));

        let aux = AuxiliaryConfig::default();
        assert_eq!(aux.connect_retry_delay(), Duration::from_secs(20));
        assert_eq!(aux.wait_window(), Duration::from_secs(3));
        assert_eq!(aux.retry_pause(), Duration::from_secs(1));
    }

    #[test]
    fn routing_mode_and_pinned_algorithm() {
        let config = PoolsConfig::from_lookup(lookup(&[
            ("MUJINA_POOL_URL", "a:1,b:2"),
            ("MUJINA_POOL_MODE", "subscribe"),
            ("MUJINA_POOL_ALGO", "sha256d"),
            ("MUJINA_AUX_LEVEL", "5"),
            ("MUJINA_AUX_URL", "aux:3333"),
        ]))
        .unwrap();

        for endpoint in &config.endpoints {
            assert_eq!(endpoint.mode(), LoginMode::SubscribeAuthorize);
            assert_eq!(endpoint.algorithm(), Some(&Algorithm::new("sha256d")));
        }
        let aux = config.auxiliary.unwrap();
        assert_eq!(aux.endpoints[0].mode(), LoginMode::Login);
        assert_eq!(aux.endpoints[0].algorithm(), None);

        let config =
            PoolsConfig::from_lookup(lookup(&[("MUJINA_POOL_URL", "a:1")])).unwrap();
        assert_eq!(config.endpoints[0].mode(), LoginMode::Login);

        let err = PoolsConfig::from_lookup(lookup(&[
            ("MUJINA_POOL_URL", "a:1"),
            ("MUJINA_POOL_MODE", "getwork"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "MUJINA_POOL_MODE".into(),
                value: "getwork".into(),
            }
        );
    }

    #[test]
    fn bad_values_rejected() {
        let err = PoolsConfig::from_lookup(lookup(&[
            ("MUJINA_POOL_URL", "a:1"),
            ("MUJINA_POOL_RETRIES", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = PoolsConfig::from_lookup(lookup(&[
            ("MUJINA_POOL_URL", "a:1"),
            ("MUJINA_AUX_LEVEL", "100"),
            ("MUJINA_AUX_URL", "aux:1"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::LevelOutOfRange(100));

        let err = PoolsConfig::from_lookup(lookup(&[
            ("MUJINA_POOL_URL", "a:1"),
            ("MUJINA_AUX_LEVEL", "5"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("MUJINA_AUX_URL".into()));
    }

    #[test]
    fn jitter_bounds_validated() {
        let aux = AuxiliaryConfig {
            endpoints: vec![Endpoint::new("aux", 1)],
            idle_jitter: (1.2, 0.8),
            ..Default::default()
        };
        assert!(matches!(
            aux.validate(),
            Err(ConfigError::InvalidJitter { .. })
        ));
    }
}
