//! Client and server configuration.
//!
//! Plain structs with defaults and `with_*` builders. [`ClientConfig::from_env`]
//! layers environment overrides on top of the defaults.

use std::time::Duration;

use skein_wire::Protocol;

use crate::ConfigError;
use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::pending::DEFAULT_MAX_PENDING;

/// Default time a call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

pub const ENV_CALL_TIMEOUT_MS: &str = "SKEIN_CALL_TIMEOUT_MS";
pub const ENV_MAX_PENDING: &str = "SKEIN_MAX_PENDING";
pub const ENV_MAX_FRAME_SIZE: &str = "SKEIN_MAX_FRAME_SIZE";
pub const ENV_PROTOCOL: &str = "SKEIN_PROTOCOL";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub protocol: Protocol,
    /// Applied to every call that does not pass its own timeout.
    pub call_timeout: Duration,
    pub max_pending: usize,
    /// Largest message accepted from or sent to the server.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            protocol: Protocol::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Defaults, overridden by `SKEIN_*` environment variables when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CALL_TIMEOUT_MS)? {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<usize>(&lookup, ENV_MAX_PENDING)? {
            config.max_pending = max;
        }
        if let Some(max) = parse_var::<usize>(&lookup, ENV_MAX_FRAME_SIZE)? {
            config.max_frame_size = max;
        }
        if let Some(protocol) = parse_var::<Protocol>(&lookup, ENV_PROTOCOL)? {
            config.protocol = protocol;
        }
        Ok(config)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}

/// Where handlers may run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadingModel {
    /// Everything runs on the connection's reactor task; nothing may block.
    #[default]
    Reactor,
    /// Blocking handlers are moved to the blocking worker pool.
    WithWorkers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub max_frame_size: usize,
    pub threading: ThreadingModel,
    /// WebSocket upgrade path; other paths are refused during the handshake.
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            protocol: Protocol::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            threading: ThreadingModel::default(),
            path: "/".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_threading(mut self, threading: ThreadingModel) -> Self {
        self.threading = threading;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Check this configuration against the handlers it will serve.
    ///
    /// Runs before the first connection is accepted, so a blocking handler
    /// on a reactor-only server is a startup failure rather than a stalled
    /// reactor later.
    pub fn validate(&self, blocking_methods: &[String]) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        if self.threading == ThreadingModel::Reactor
            && let Some(method) = blocking_methods.first()
        {
            return Err(ConfigError::BlockingHandlerOnReactor {
                method: method.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let vars: HashMap<_, _> = vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert_eq!(config.max_pending, 8192);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.protocol, Protocol::Postcard);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            (ENV_CALL_TIMEOUT_MS, "250"),
            (ENV_MAX_PENDING, "16"),
            (ENV_MAX_FRAME_SIZE, "1024"),
            (ENV_PROTOCOL, "json"),
        ]))
        .unwrap();
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.max_pending, 16);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.protocol, Protocol::Json);
    }

    #[test]
    fn malformed_env_is_rejected() {
        let err = ClientConfig::from_lookup(lookup_from(&[(ENV_MAX_PENDING, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: ENV_MAX_PENDING,
                value: "lots".to_string(),
            }
        );
    }

    #[test]
    fn builders_override_fields() {
        let config = ClientConfig::default()
            .with_call_timeout(Duration::from_millis(50))
            .with_max_pending(4);
        assert_eq!(config.call_timeout, Duration::from_millis(50));
        assert_eq!(config.max_pending, 4);
    }

    #[test]
    fn blocking_handler_on_reactor_is_rejected() {
        let config = ServerConfig::default();
        let err = config.validate(&["crunch".to_string()]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::BlockingHandlerOnReactor {
                method: "crunch".to_string()
            }
        );
    }

    #[test]
    fn blocking_handler_with_workers_is_accepted() {
        let config = ServerConfig::default().with_threading(ThreadingModel::WithWorkers);
        config.validate(&["crunch".to_string()]).unwrap();
        ServerConfig::default().validate(&[]).unwrap();
    }

    #[test]
    fn path_must_be_absolute() {
        let config = ServerConfig::default().with_path("calc");
        assert!(matches!(
            config.validate(&[]),
            Err(ConfigError::InvalidPath(_))
        ));
    }
}
