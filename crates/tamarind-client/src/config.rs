//! Client configuration
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional config file (any format the `config` crate understands) and
//! `TAMARIND_*` environment variables, e.g. `TAMARIND_ENDPOINTS=h1:2181,h2:2181`
//! or `TAMARIND_SESSION_TIMEOUT_MS=30000`.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tamarind_common::{
    DEFAULT_LOCK_ROOT, DEFAULT_RETRY_INTERVAL_MS, DEFAULT_SESSION_TIMEOUT_MS, Endpoint,
    parse_endpoints, validate_path,
};

use crate::error::{ClientError, Result};

const ENV_PREFIX: &str = "TAMARIND";

/// Settings for one session and the lock/data helpers built on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Ordered `host:port` endpoints; items may be comma-separated lists
    pub endpoints: Vec<String>,
    pub session_timeout_ms: u64,
    /// Bound on the connect wait; `None` waits indefinitely
    pub connect_timeout_ms: Option<u64>,
    /// Parent node of resource lock nodes
    pub lock_root: String,
    /// Pause between lock attempts under contention
    pub retry_interval_ms: u64,
    /// Default fault policy of lock acquisition
    pub fail_fast: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2181".to_string()],
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            connect_timeout_ms: None,
            lock_root: DEFAULT_LOCK_ROOT.to_string(),
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            fail_fast: false,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoints: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoints.into()],
            ..Default::default()
        }
    }

    pub fn with_endpoints<S: Into<String>>(mut self, endpoints: impl IntoIterator<Item = S>) -> Self {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_lock_root(mut self, root: impl Into<String>) -> Self {
        self.lock_root = root.into();
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Load from an optional file overlaid with `TAMARIND_*` variables.
    pub fn load(file: Option<&str>) -> Result<Self> {
        Self::load_with_env(file, None)
    }

    fn load_with_env(file: Option<&str>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ClientConfig::default())?);

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("endpoints")
                .source(env),
        );

        let config: ClientConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings without touching the network.
    pub fn validate(&self) -> Result<()> {
        self.parsed_endpoints()?;
        validate_path(&self.lock_root)
            .map_err(|e| ClientError::Config(format!("lock_root: {}", e)))?;
        if self.session_timeout_ms == 0 {
            return Err(ClientError::Config(
                "session_timeout_ms must be positive".to_string(),
            ));
        }
        // Sent to the ensemble as a signed 32-bit millisecond count
        if self.session_timeout_ms > i32::MAX as u64 {
            return Err(ClientError::Config(format!(
                "session_timeout_ms must not exceed {}",
                i32::MAX
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(ClientError::Config(
                "retry_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn parsed_endpoints(&self) -> Result<Vec<Endpoint>> {
        parse_endpoints(&self.endpoints).map_err(|e| ClientError::Connection(e.to_string()))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.session_timeout(), Duration::from_secs(50));
        assert_eq!(config.retry_interval(), Duration::from_millis(20));
        assert_eq!(config.lock_root, "/locks");
        assert_eq!(config.connect_timeout(), None);
        assert!(!config.fail_fast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("zk1:2181,zk2:2181")
            .with_session_timeout(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(1))
            .with_lock_root("/app/locks")
            .with_retry_interval(Duration::from_millis(5))
            .with_fail_fast(true);

        assert_eq!(config.parsed_endpoints().unwrap().len(), 2);
        assert_eq!(config.session_timeout_ms, 5000);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.lock_root, "/app/locks");
        assert!(config.fail_fast);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let err = ClientConfig::default()
            .with_endpoints(Vec::<String>::new())
            .validate()
            .unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));

        assert!(
            ClientConfig::default()
                .with_lock_root("locks")
                .validate()
                .is_err()
        );
        assert!(
            ClientConfig::default()
                .with_retry_interval(Duration::ZERO)
                .validate()
                .is_err()
        );

        let err = ClientConfig::default()
            .with_session_timeout(Duration::from_millis(i32::MAX as u64 + 1))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert!(
            ClientConfig::default()
                .with_session_timeout(Duration::from_millis(i32::MAX as u64))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "endpoints = [\"zk1:2181\", \"zk2:2181\"]\nsession_timeout_ms = 8000\nlock_root = \"/svc/locks\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = ClientConfig::load_with_env(Some(&path), Some(HashMap::new())).unwrap();
        assert_eq!(config.endpoints, vec!["zk1:2181", "zk2:2181"]);
        assert_eq!(config.session_timeout_ms, 8000);
        assert_eq!(config.lock_root, "/svc/locks");
        assert_eq!(config.retry_interval_ms, DEFAULT_RETRY_INTERVAL_MS);

        let env = HashMap::from([
            ("TAMARIND_ENDPOINTS".to_string(), "a:1,b:2,c:3".to_string()),
            ("TAMARIND_FAIL_FAST".to_string(), "true".to_string()),
        ]);
        let config = ClientConfig::load_with_env(Some(&path), Some(env)).unwrap();
        assert_eq!(config.endpoints, vec!["a:1", "b:2", "c:3"]);
        assert!(config.fail_fast);
        assert_eq!(config.session_timeout_ms, 8000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = ClientConfig::load_with_env(Some("/nonexistent/tamarind.toml"), Some(HashMap::new()));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
