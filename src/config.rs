//! Service configuration.
//!
//! [`ServiceConfig`] holds the concrete values that drive a service, its work
//! pool and its reactors. It can be built three ways, in increasing order of
//! precedence:
//!
//! 1. **Defaults** - [`ServiceConfig::default()`]
//! 2. **Parameters** - a string map using the keys below, via
//!    [`ServiceConfig::from_parameters`]
//! 3. **Environment** - `POOLED_REACTOR_*` variables, via
//!    [`apply_env_overrides`]
//!
//! Config-file loading is left to the embedder: every type here derives
//! `serde::Deserialize` with the same camelCase keys.
//!
//! # Parameters
//!
//! | Key | Type | Default |
//! |-----|------|---------|
//! | `type` | `connection` \| `connectionless` | `connection` |
//! | `bindHost` | host or IP | `0.0.0.0` |
//! | `port` | `u16`, `0` = auto-allocate | `0` |
//! | `socketProvider` | provider name | raw socket |
//! | `socketParameters` | JSON object of strings | `{}` |
//! | `chunkSize` | bytes per read | `4096` |
//! | `threads` | worker threads | available parallelism |
//! | `schedulingAlgorithm` | `fixed` \| `elastic` | `fixed` |
//! | `maxThreads` | upper bound for `elastic` | `threads` |
//! | `maxWorkPerThread` | connections per worker, `0` = unlimited | `0` |
//! | `workSchedulingAlgorithm` | `round-robin` \| `least-loaded` | `round-robin` |
//! | `clientConnectionTimeout` | accept-poll interval, seconds | `0.25` |
//! | `connectionTimeout` | idle deadline, seconds, `0` = never | `300` |
//! | `requestTimeout` | seconds | `30` |
//! | `responseTimeout` | seconds | `30` |
//! | `pollTimeout` | reactor poll bound, seconds | `0.1` |

use crate::error::Error;
use crate::net::SocketParameters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error as ThisError;

/// String parameters as handed to a service at start.
pub type ServiceParameters = BTreeMap<String, String>;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "POOLED_REACTOR_";
/// Environment variable name for the worker thread count.
pub const ENV_THREADS: &str = "POOLED_REACTOR_THREADS";
/// Environment variable name for the maximum worker thread count.
pub const ENV_MAX_THREADS: &str = "POOLED_REACTOR_MAX_THREADS";
/// Environment variable name for the per-worker work cap.
pub const ENV_MAX_WORK_PER_THREAD: &str = "POOLED_REACTOR_MAX_WORK_PER_THREAD";
/// Environment variable name for the read chunk size.
pub const ENV_CHUNK_SIZE: &str = "POOLED_REACTOR_CHUNK_SIZE";
/// Environment variable name for the idle connection timeout (seconds).
pub const ENV_CONNECTION_TIMEOUT: &str = "POOLED_REACTOR_CONNECTION_TIMEOUT";
/// Environment variable name for the request timeout (seconds).
pub const ENV_REQUEST_TIMEOUT: &str = "POOLED_REACTOR_REQUEST_TIMEOUT";
/// Environment variable name for the response timeout (seconds).
pub const ENV_RESPONSE_TIMEOUT: &str = "POOLED_REACTOR_RESPONSE_TIMEOUT";

const DEFAULT_CHUNK_SIZE: usize = 4096;
const DEFAULT_LISTEN_BACKLOG: i32 = 8;
/// Upper bound on the accept and reactor poll intervals.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Errors raised while resolving configuration.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ConfigError {
    /// A key was present but its value did not parse.
    #[error("invalid value for {key}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Parameter or variable name.
        key: String,
        /// Human-readable description of the expected type.
        expected: &'static str,
        /// The offending raw value.
        value: String,
    },
    /// A parameter key is not recognized.
    #[error("unknown service parameter {0:?}")]
    UnknownKey(String),
    /// The combination of values is inconsistent.
    #[error("{0}")]
    Inconsistent(String),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::config(err.to_string()).with_source(err)
    }
}

/// Socket flavour of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Stream sockets; each accepted socket becomes a long-lived connection.
    #[default]
    Connection,
    /// Datagram sockets; each datagram is a one-shot unit of work.
    Connectionless,
}

impl FromStr for TransportKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connection" | "stream" | "tcp" => Ok(Self::Connection),
            "connectionless" | "datagram" | "udp" => Ok(Self::Connectionless),
            _ => Err(()),
        }
    }
}

/// How the pool sizes its set of workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadScheduling {
    /// Exactly `threads` workers for the pool's lifetime.
    #[default]
    Fixed,
    /// Start with `threads` workers and add more, up to `max_threads`, when
    /// every worker is at `max_work_per_thread`.
    Elastic,
}

impl FromStr for ThreadScheduling {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "elastic" => Ok(Self::Elastic),
            _ => Err(()),
        }
    }
}

/// How the pool picks the worker that receives a new work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkScheduling {
    /// Cycle through workers, skipping saturated ones.
    #[default]
    RoundRobin,
    /// Pick the worker with the fewest assigned items.
    LeastLoaded,
}

impl FromStr for WorkScheduling {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least-loaded" | "leastloaded" => Ok(Self::LeastLoaded),
            _ => Err(()),
        }
    }
}

/// Work pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Workers started with the pool.
    pub threads: usize,
    /// Worker sizing policy.
    #[serde(rename = "schedulingAlgorithm")]
    pub thread_scheduling: ThreadScheduling,
    /// Upper bound on workers under [`ThreadScheduling::Elastic`].
    pub max_threads: usize,
    /// Work items per worker; `0` means unlimited.
    pub max_work_per_thread: usize,
    /// Work placement policy.
    #[serde(rename = "workSchedulingAlgorithm")]
    pub work_scheduling: WorkScheduling,
}

impl PoolConfig {
    /// Normalize values to safe defaults.
    pub fn normalize(&mut self) {
        if self.threads == 0 {
            self.threads = 1;
        }
        if self.max_threads < self.threads {
            self.max_threads = self.threads;
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1);
        Self {
            threads,
            thread_scheduling: ThreadScheduling::Fixed,
            max_threads: threads,
            max_work_per_thread: 0,
            work_scheduling: WorkScheduling::RoundRobin,
        }
    }
}

/// The four independent service timeouts plus the reactor poll bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    /// Accept/receive poll interval; bounds how long `stop()` waits for the loop.
    #[serde(rename = "clientConnectionTimeout", with = "secs_f64")]
    pub accept_poll: Duration,
    /// Idle deadline armed on every connection; zero disables it.
    #[serde(rename = "connectionTimeout", with = "secs_f64")]
    pub connection: Duration,
    /// Bound on server-side reads.
    #[serde(rename = "requestTimeout", with = "secs_f64")]
    pub request: Duration,
    /// Bound on server-side writes.
    #[serde(rename = "responseTimeout", with = "secs_f64")]
    pub response: Duration,
    /// Bound on one reactor poll, keeping sweeps and shutdown responsive.
    #[serde(rename = "pollTimeout", with = "secs_f64")]
    pub poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            accept_poll: Duration::from_millis(250),
            connection: Duration::from_secs(300),
            request: Duration::from_secs(30),
            response: Duration::from_secs(30),
            poll: Duration::from_millis(100),
        }
    }
}

/// Full configuration of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Stream or datagram service.
    #[serde(rename = "type")]
    pub transport: TransportKind,
    /// Host or address to bind.
    pub bind_host: String,
    /// Port to bind; `0` asks the port allocator.
    pub port: u16,
    /// Named socket provider; `None` creates a raw socket.
    pub socket_provider: Option<String>,
    /// Opaque settings forwarded to providers and upgraders.
    pub socket_parameters: SocketParameters,
    /// Maximum bytes per read.
    pub chunk_size: usize,
    /// Listen backlog for stream services.
    pub listen_backlog: i32,
    /// Work pool sizing.
    #[serde(flatten)]
    pub pool: PoolConfig,
    /// Timeouts.
    #[serde(flatten)]
    pub timeouts: Timeouts,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Connection,
            bind_host: "0.0.0.0".to_string(),
            port: 0,
            socket_provider: None,
            socket_parameters: SocketParameters::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            pool: PoolConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ServiceConfig {
    /// Starts from defaults for the given transport.
    #[must_use]
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    /// Sets the bind host.
    #[must_use]
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Sets the port (`0` = auto-allocate).
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the read chunk size.
    #[must_use]
    pub const fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the number of workers.
    #[must_use]
    pub const fn threads(mut self, threads: usize) -> Self {
        self.pool.threads = threads;
        self
    }

    /// Sets the named socket provider.
    #[must_use]
    pub fn socket_provider(mut self, name: impl Into<String>) -> Self {
        self.socket_provider = Some(name.into());
        self
    }

    /// Sets the idle deadline.
    #[must_use]
    pub const fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection = timeout;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    /// Sets the response timeout.
    #[must_use]
    pub const fn response_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.response = timeout;
        self
    }

    /// Parses service parameters on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown keys, unparseable values, or an
    /// inconsistent combination.
    pub fn from_parameters(params: &ServiceParameters) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in params {
            config.apply_parameter(key, value)?;
        }
        if params.contains_key("maxThreads") && config.pool.max_threads < config.pool.threads {
            return Err(ConfigError::Inconsistent(format!(
                "maxThreads ({}) is below threads ({})",
                config.pool.max_threads, config.pool.threads
            )));
        }
        config.validate()?;
        config.normalize();
        Ok(config)
    }

    fn apply_parameter(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "type" => self.transport = parse_enum(key, value, "connection|connectionless")?,
            "bindHost" => self.bind_host = value.trim().to_string(),
            "port" => self.port = parse_num(key, value, "u16")?,
            "socketProvider" => {
                let name = value.trim();
                self.socket_provider = (!name.is_empty()).then(|| name.to_string());
            }
            "socketParameters" => {
                self.socket_parameters = serde_json::from_str(value).map_err(|_| {
                    ConfigError::InvalidValue {
                        key: key.to_string(),
                        expected: "JSON object of strings",
                        value: value.to_string(),
                    }
                })?;
            }
            "chunkSize" => self.chunk_size = parse_num(key, value, "unsigned integer")?,
            "threads" => self.pool.threads = parse_num(key, value, "unsigned integer")?,
            "schedulingAlgorithm" => {
                self.pool.thread_scheduling = parse_enum(key, value, "fixed|elastic")?;
            }
            "maxThreads" => self.pool.max_threads = parse_num(key, value, "unsigned integer")?,
            "maxWorkPerThread" => {
                self.pool.max_work_per_thread = parse_num(key, value, "unsigned integer")?;
            }
            "workSchedulingAlgorithm" => {
                self.pool.work_scheduling = parse_enum(key, value, "round-robin|least-loaded")?;
            }
            "clientConnectionTimeout" => self.timeouts.accept_poll = parse_secs(key, value)?,
            "connectionTimeout" => self.timeouts.connection = parse_secs(key, value)?,
            "requestTimeout" => self.timeouts.request = parse_secs(key, value)?,
            "responseTimeout" => self.timeouts.response = parse_secs(key, value)?,
            "pollTimeout" => self.timeouts.poll = parse_secs(key, value)?,
            "listenBacklog" => self.listen_backlog = parse_num(key, value, "i32")?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Inconsistent`] when values contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Inconsistent("chunkSize must be at least 1".into()));
        }
        if self.timeouts.accept_poll.is_zero() || self.timeouts.poll.is_zero() {
            return Err(ConfigError::Inconsistent(
                "poll intervals must be non-zero".into(),
            ));
        }
        if self.timeouts.accept_poll > MAX_POLL_INTERVAL || self.timeouts.poll > MAX_POLL_INTERVAL {
            return Err(ConfigError::Inconsistent(format!(
                "poll intervals must not exceed {}s",
                MAX_POLL_INTERVAL.as_secs()
            )));
        }
        Ok(())
    }

    /// Normalize values to safe defaults.
    pub fn normalize(&mut self) {
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.listen_backlog <= 0 {
            self.listen_backlog = DEFAULT_LISTEN_BACKLOG;
        }
        if self.bind_host.is_empty() {
            self.bind_host = "0.0.0.0".to_string();
        }
        self.pool.normalize();
    }
}

/// Apply `POOLED_REACTOR_*` environment overrides to a [`ServiceConfig`].
///
/// Only variables that are set are applied.
///
/// # Errors
///
/// Returns an error if a variable is set but does not parse.
pub fn apply_env_overrides(config: &mut ServiceConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_THREADS) {
        config.pool.threads = parse_num(ENV_THREADS, &val, "unsigned integer")?;
    }
    if let Some(val) = read_env(ENV_MAX_THREADS) {
        config.pool.max_threads = parse_num(ENV_MAX_THREADS, &val, "unsigned integer")?;
    }
    if let Some(val) = read_env(ENV_MAX_WORK_PER_THREAD) {
        config.pool.max_work_per_thread =
            parse_num(ENV_MAX_WORK_PER_THREAD, &val, "unsigned integer")?;
    }
    if let Some(val) = read_env(ENV_CHUNK_SIZE) {
        config.chunk_size = parse_num(ENV_CHUNK_SIZE, &val, "unsigned integer")?;
    }
    if let Some(val) = read_env(ENV_CONNECTION_TIMEOUT) {
        config.timeouts.connection = parse_secs(ENV_CONNECTION_TIMEOUT, &val)?;
    }
    if let Some(val) = read_env(ENV_REQUEST_TIMEOUT) {
        config.timeouts.request = parse_secs(ENV_REQUEST_TIMEOUT, &val)?;
    }
    if let Some(val) = read_env(ENV_RESPONSE_TIMEOUT) {
        config.timeouts.response = parse_secs(ENV_RESPONSE_TIMEOUT, &val)?;
    }
    config.normalize();
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_num<T: FromStr>(key: &str, val: &str, expected: &'static str) -> Result<T, ConfigError> {
    val.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        expected,
        value: val.to_string(),
    })
}

fn parse_enum<T: FromStr>(key: &str, val: &str, expected: &'static str) -> Result<T, ConfigError> {
    parse_num(key, val, expected)
}

fn parse_secs(key: &str, val: &str) -> Result<Duration, ConfigError> {
    let raw = val.trim();
    let raw = raw.strip_suffix('s').unwrap_or(raw);
    let invalid = || ConfigError::InvalidValue {
        key: key.to_string(),
        expected: "non-negative seconds",
        value: val.to_string(),
    };
    let secs: f64 = raw.trim().parse().map_err(|_| invalid())?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Connectionless => write!(f, "connectionless"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn params(pairs: &[(&str, &str)]) -> ServiceParameters {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn parses_every_documented_key() {
        init_test("parses_every_documented_key");
        let config = ServiceConfig::from_parameters(&params(&[
            ("type", "connectionless"),
            ("bindHost", "127.0.0.1"),
            ("port", "4110"),
            ("socketProvider", "tls"),
            ("socketParameters", r#"{"cert":"server.pem"}"#),
            ("chunkSize", "512"),
            ("threads", "2"),
            ("schedulingAlgorithm", "elastic"),
            ("maxThreads", "6"),
            ("maxWorkPerThread", "100"),
            ("workSchedulingAlgorithm", "least-loaded"),
            ("clientConnectionTimeout", "0.5"),
            ("connectionTimeout", "60"),
            ("requestTimeout", "2.5"),
            ("responseTimeout", "0.01s"),
        ]))
        .expect("parse");

        assert_eq!(config.transport, TransportKind::Connectionless);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.port, 4110);
        assert_eq!(config.socket_provider.as_deref(), Some("tls"));
        assert_eq!(
            config.socket_parameters.get("cert").map(String::as_str),
            Some("server.pem")
        );
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.pool.threads, 2);
        assert_eq!(config.pool.thread_scheduling, ThreadScheduling::Elastic);
        assert_eq!(config.pool.max_threads, 6);
        assert_eq!(config.pool.max_work_per_thread, 100);
        assert_eq!(config.pool.work_scheduling, WorkScheduling::LeastLoaded);
        assert_eq!(config.timeouts.accept_poll, Duration::from_millis(500));
        assert_eq!(config.timeouts.connection, Duration::from_secs(60));
        assert_eq!(config.timeouts.request, Duration::from_millis(2500));
        assert_eq!(config.timeouts.response, Duration::from_millis(10));
        crate::test_complete!("parses_every_documented_key");
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        init_test("rejects_unknown_and_malformed");
        let unknown = ServiceConfig::from_parameters(&params(&[("prot", "80")]));
        crate::assert_with_log!(
            matches!(unknown, Err(ConfigError::UnknownKey(_))),
            "unknown key",
            "UnknownKey",
            unknown
        );
        let bad_port = ServiceConfig::from_parameters(&params(&[("port", "70000")]));
        crate::assert_with_log!(
            matches!(bad_port, Err(ConfigError::InvalidValue { .. })),
            "bad port",
            "InvalidValue",
            bad_port
        );
        let negative = ServiceConfig::from_parameters(&params(&[("requestTimeout", "-1")]));
        crate::assert_with_log!(negative.is_err(), "negative timeout", true, negative);
        let inconsistent =
            ServiceConfig::from_parameters(&params(&[("threads", "4"), ("maxThreads", "2")]));
        crate::assert_with_log!(
            matches!(inconsistent, Err(ConfigError::Inconsistent(_))),
            "max below threads",
            "Inconsistent",
            inconsistent
        );
        let huge_poll =
            ServiceConfig::from_parameters(&params(&[("clientConnectionTimeout", "1e19")]));
        crate::assert_with_log!(
            matches!(huge_poll, Err(ConfigError::Inconsistent(_))),
            "accept poll above the bound",
            "Inconsistent",
            huge_poll
        );
        let huge_tick = ServiceConfig::from_parameters(&params(&[("pollTimeout", "7200")]));
        crate::assert_with_log!(
            matches!(huge_tick, Err(ConfigError::Inconsistent(_))),
            "reactor poll above the bound",
            "Inconsistent",
            huge_tick
        );
        crate::test_complete!("rejects_unknown_and_malformed");
    }

    #[test]
    fn normalize_fills_pool_bounds() {
        init_test("normalize_fills_pool_bounds");
        let mut config = ServiceConfig::default();
        config.pool.threads = 0;
        config.pool.max_threads = 0;
        config.listen_backlog = 0;
        config.normalize();
        assert_eq!(config.pool.threads, 1);
        assert_eq!(config.pool.max_threads, 1);
        assert!(config.listen_backlog > 0);
        crate::test_complete!("normalize_fills_pool_bounds");
    }

    #[test]
    fn env_overrides_apply() {
        init_test("env_overrides_apply");
        std::env::set_var(ENV_CHUNK_SIZE, "1024");
        std::env::set_var(ENV_CONNECTION_TIMEOUT, "1.5");
        let mut config = ServiceConfig::default();
        let result = apply_env_overrides(&mut config);
        std::env::remove_var(ENV_CHUNK_SIZE);
        std::env::remove_var(ENV_CONNECTION_TIMEOUT);
        result.expect("overrides");
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.timeouts.connection, Duration::from_millis(1500));
        crate::test_complete!("env_overrides_apply");
    }

    #[test]
    fn deserializes_from_json() {
        init_test("deserializes_from_json");
        let config: ServiceConfig = serde_json::from_str(
            r#"{"type":"connection","port":9000,"threads":3,"responseTimeout":0.25}"#,
        )
        .expect("json");
        assert_eq!(config.port, 9000);
        assert_eq!(config.pool.threads, 3);
        assert_eq!(config.timeouts.response, Duration::from_millis(250));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        crate::test_complete!("deserializes_from_json");
    }
}
