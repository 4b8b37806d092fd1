use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::client::DEFAULT_TIMEOUT;
use crate::coordinator::{
    DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_CONCURRENT_FETCHES,
    DEFAULT_OFFLINE_AFTER_FAILURES, DEFAULT_POLL_INTERVAL,
};
use crate::logger::MessageLogMode;
use crate::protocol::DEFAULT_BASE_URL;
use crate::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub email: String,
    pub password: SecretString,
    pub base_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub offline_after_failures: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_concurrent_fetches: usize,
    /// Wire capture destination and mode, if enabled.
    pub message_log: Option<(MessageLogMode, PathBuf)>,
}

impl Config {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_TIMEOUT,
            offline_after_failures: DEFAULT_OFFLINE_AFTER_FAILURES,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            message_log: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; `from_env` passes the
    /// process environment.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            optional(key)
                .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
        };

        let mut config = Self::new(required("ATMEEX_EMAIL")?, required("ATMEEX_PASSWORD")?);

        if let Some(url) = optional("ATMEEX_BASE_URL") {
            config.base_url = url;
        }
        if let Some(secs) = parse::<u64>(
            optional("ATMEEX_POLL_INTERVAL_SECS"),
            "ATMEEX_POLL_INTERVAL_SECS",
        )? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(
            optional("ATMEEX_REQUEST_TIMEOUT_SECS"),
            "ATMEEX_REQUEST_TIMEOUT_SECS",
        )? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<u32>(
            optional("ATMEEX_OFFLINE_AFTER_FAILURES"),
            "ATMEEX_OFFLINE_AFTER_FAILURES",
        )? {
            config.offline_after_failures = n;
        }
        if let Some(secs) = parse::<u64>(
            optional("ATMEEX_BACKOFF_INITIAL_SECS"),
            "ATMEEX_BACKOFF_INITIAL_SECS",
        )? {
            config.backoff_initial = Duration::from_secs(secs);
        }
        if let Some(secs) =
            parse::<u64>(optional("ATMEEX_BACKOFF_MAX_SECS"), "ATMEEX_BACKOFF_MAX_SECS")?
        {
            config.backoff_max = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<usize>(
            optional("ATMEEX_MAX_CONCURRENT_FETCHES"),
            "ATMEEX_MAX_CONCURRENT_FETCHES",
        )? {
            config.max_concurrent_fetches = n;
        }
        if let Some(path) = optional("ATMEEX_MESSAGE_LOG") {
            let mode = match optional("ATMEEX_MESSAGE_LOG_MODE") {
                Some(m) => m.parse::<MessageLogMode>().map_err(Error::Config)?,
                None => MessageLogMode::Full,
            };
            config.message_log = Some((mode, PathBuf::from(path)));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.email.trim().is_empty() {
            return Err(Error::Config("email must not be empty".into()));
        }
        if self.password.expose_secret().is_empty() {
            return Err(Error::Config("password must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be > 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be > 0".into()));
        }
        if self.offline_after_failures == 0 {
            return Err(Error::Config("offline threshold must be > 0".into()));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(Error::Config("fetch concurrency must be > 0".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(raw: Option<String>, key: &str) -> Result<Option<T>> {
    raw.map(|v| {
        v.trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {v}")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_vars(vars(&[
            ("ATMEEX_EMAIL", "me@example.com"),
            ("ATMEEX_PASSWORD", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(config.base_url, "https://api.iot.atmeex.com");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.offline_after_failures, 3);
        assert_eq!(config.backoff_max, Duration::from_secs(900));
        assert_eq!(config.max_concurrent_fetches, 4);
        assert!(config.message_log.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = Config::from_vars(vars(&[
            ("ATMEEX_EMAIL", "me@example.com"),
            ("ATMEEX_PASSWORD", "hunter2"),
            ("ATMEEX_POLL_INTERVAL_SECS", "60"),
            ("ATMEEX_OFFLINE_AFTER_FAILURES", "5"),
            ("ATMEEX_MESSAGE_LOG", "/tmp/wire.ndjson"),
            ("ATMEEX_MESSAGE_LOG_MODE", "diffed"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.offline_after_failures, 5);
        assert_eq!(
            config.message_log,
            Some((MessageLogMode::Diffed, PathBuf::from("/tmp/wire.ndjson")))
        );
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let err = Config::from_vars(vars(&[("ATMEEX_EMAIL", "me@example.com")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("ATMEEX_PASSWORD")));

        let err = Config::from_vars(vars(&[("ATMEEX_PASSWORD", "x"), ("ATMEEX_EMAIL", " ")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = Config::from_vars(vars(&[
            ("ATMEEX_EMAIL", "me@example.com"),
            ("ATMEEX_PASSWORD", "hunter2"),
            ("ATMEEX_POLL_INTERVAL_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("ATMEEX_POLL_INTERVAL_SECS")));
    }

    #[test]
    fn debug_hides_password() {
        let config = Config::new("me@example.com", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
