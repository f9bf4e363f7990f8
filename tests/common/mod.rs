#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use parking_lot::Mutex;
use pooled_reactor::config::{ServiceConfig, TransportKind};
use pooled_reactor::connection::{Connection, Datagram, WorkKey};
use pooled_reactor::error::{Error, Result};
use pooled_reactor::handler::{ClientServiceHandler, DatagramHandler, Disposition};
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "POOLED_REACTOR_PROPTEST_SEED";

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = read_proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }
    None
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Polls `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// A loopback service configuration with small, test-friendly intervals.
#[must_use]
pub fn loopback_config(kind: TransportKind) -> ServiceConfig {
    let mut config = ServiceConfig::new(kind).bind_host("127.0.0.1").threads(2);
    config.timeouts.accept_poll = Duration::from_millis(20);
    config.timeouts.poll = Duration::from_millis(20);
    config
}

/// One handler callback, as seen by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Opened(WorkKey),
    Request(WorkKey, Vec<u8>),
    Closed(WorkKey),
}

impl Call {
    /// Key of the unit the callback ran for.
    #[must_use]
    pub fn key(&self) -> WorkKey {
        match self {
            Self::Opened(key) | Self::Request(key, _) | Self::Closed(key) => *key,
        }
    }
}

/// Echo handler that records every callback.
///
/// Stream requests are echoed back and the connection kept open; a request
/// of exactly `b"bye"` closes it after the echo.
#[derive(Debug, Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    /// Snapshot of the recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Number of `Closed` calls.
    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, Call::Closed(_)))
            .count()
    }

    fn push(&self, call: Call) {
        tracing::debug!(?call, "handler callback");
        self.calls.lock().push(call);
    }
}

impl ClientServiceHandler for Recorder {
    fn handle_opened(&self, connection: &mut Connection) {
        self.push(Call::Opened(connection.key()));
    }

    fn handle_closed(&self, connection: &mut Connection) {
        self.push(Call::Closed(connection.key()));
    }

    fn handle_request(&self, connection: &mut Connection) -> Result<Disposition> {
        let data = connection.retrieve()?;
        self.push(Call::Request(connection.key(), data.clone()));
        if data.is_empty() {
            return Ok(Disposition::Close);
        }
        connection.send_default(&data)?;
        if data == b"bye" {
            Ok(Disposition::Close)
        } else {
            Ok(Disposition::KeepOpen)
        }
    }
}

impl DatagramHandler for Recorder {
    fn handle_opened(&self, datagram: &Datagram) {
        self.push(Call::Opened(datagram.key()));
    }

    fn handle_closed(&self, datagram: &Datagram) {
        self.push(Call::Closed(datagram.key()));
    }

    fn handle_request(&self, datagram: &Datagram) -> Result<()> {
        self.push(Call::Request(datagram.key(), datagram.payload().to_vec()));
        if datagram.payload() == b"fail" {
            return Err(Error::invalid_data());
        }
        datagram.send(datagram.payload())
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
