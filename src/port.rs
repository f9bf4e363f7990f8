//! Port allocation from disjoint configured ranges.
//!
//! A [`PortAllocator`] hands out ports in strictly increasing order, walking
//! an ordered list of disjoint inclusive ranges. When the last range is
//! exhausted every further call fails with
//! [`ErrorKind::PortStarvation`](crate::error::ErrorKind::PortStarvation);
//! the failure is fatal to that call only.
//!
//! The process-wide allocator returned by [`PortAllocator::global`] is shared
//! by every service in the process, so its cursor sits behind a single mutex.
//!
//! # Example
//!
//! ```
//! use pooled_reactor::port::PortAllocator;
//!
//! let ports = PortAllocator::new(vec![10_000..=10_001, 20_000..=20_000]).unwrap();
//! assert_eq!(ports.generate_port().unwrap(), 10_000);
//! assert_eq!(ports.generate_port().unwrap(), 10_001);
//! assert_eq!(ports.generate_port().unwrap(), 20_000);
//! assert!(ports.generate_port().is_err());
//! ```

use crate::error::{Error, Result};
use crate::tracing_compat::{debug, warn};
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::sync::OnceLock;

/// Environment variable overriding the global allocator's ranges,
/// e.g. `"40000-40999,42000-42999"`.
pub const ENV_PORT_RANGES: &str = "POOLED_REACTOR_PORT_RANGES";

/// Ranges used by the global allocator when no override is set.
///
/// Kept below the usual ephemeral range so auto-assigned service ports do not
/// race with outbound client sockets.
pub const DEFAULT_PORT_RANGES: &[RangeInclusive<u16>] = &[40_000..=49_151];

static GLOBAL: OnceLock<PortAllocator> = OnceLock::new();

#[derive(Debug)]
struct Cursor {
    /// Index of the active range.
    range: usize,
    /// Last port issued from the active range.
    last: Option<u16>,
}

/// Hands out non-colliding ports from ordered, disjoint ranges.
#[derive(Debug)]
pub struct PortAllocator {
    ranges: Vec<RangeInclusive<u16>>,
    cursor: Mutex<Cursor>,
}

impl PortAllocator {
    /// Creates an allocator over `ranges`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the list is empty, a range is empty, or the
    /// ranges are not ascending and disjoint.
    pub fn new(ranges: Vec<RangeInclusive<u16>>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(Error::config("port allocator needs at least one range"));
        }
        for range in &ranges {
            if range.start() > range.end() {
                return Err(Error::config(format!("empty port range {range:?}")));
            }
        }
        for pair in ranges.windows(2) {
            if pair[0].end() >= pair[1].start() {
                return Err(Error::config(format!(
                    "port ranges {:?} and {:?} overlap or are out of order",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self {
            ranges,
            cursor: Mutex::new(Cursor {
                range: 0,
                last: None,
            }),
        })
    }

    /// Returns the process-wide allocator.
    ///
    /// Initialized on first use from [`ENV_PORT_RANGES`] or, when unset or
    /// invalid, from [`DEFAULT_PORT_RANGES`].
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| {
            let from_env = std::env::var(ENV_PORT_RANGES)
                .ok()
                .map(|raw| parse_ranges(&raw).and_then(Self::new));
            match from_env {
                Some(Ok(allocator)) => allocator,
                Some(Err(err)) => {
                    warn!(error = %err, "ignoring {ENV_PORT_RANGES}");
                    Self::with_defaults()
                }
                None => Self::with_defaults(),
            }
        })
    }

    fn with_defaults() -> Self {
        Self {
            ranges: DEFAULT_PORT_RANGES.to_vec(),
            cursor: Mutex::new(Cursor {
                range: 0,
                last: None,
            }),
        }
    }

    /// Returns the next free port.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PortStarvation`](crate::error::ErrorKind::PortStarvation)
    /// once every range has been handed out.
    pub fn generate_port(&self) -> Result<u16> {
        let mut cursor = self.cursor.lock();
        loop {
            let Some(range) = self.ranges.get(cursor.range) else {
                return Err(Error::port_starvation(self.ranges.len()));
            };
            let candidate = match cursor.last {
                None => Some(*range.start()),
                Some(port) => port.checked_add(1),
            };
            match candidate {
                Some(port) if port <= *range.end() => {
                    cursor.last = Some(port);
                    debug!(port, "port allocated");
                    return Ok(port);
                }
                _ => {
                    cursor.range += 1;
                    cursor.last = None;
                }
            }
        }
    }

    /// Returns the configured ranges.
    #[must_use]
    pub fn ranges(&self) -> &[RangeInclusive<u16>] {
        &self.ranges
    }

    /// Returns how many ports remain before starvation.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let cursor = self.cursor.lock();
        self.ranges
            .iter()
            .enumerate()
            .skip(cursor.range)
            .map(|(idx, range)| {
                let start = match (idx == cursor.range, cursor.last) {
                    (true, Some(last)) => usize::from(last) + 1,
                    _ => usize::from(*range.start()),
                };
                (usize::from(*range.end()) + 1).saturating_sub(start)
            })
            .sum()
    }
}

/// Parses `"low-high,low-high"` into ranges. A bare `"port"` is a one-port range.
///
/// # Errors
///
/// Returns a config error for malformed entries.
pub fn parse_ranges(raw: &str) -> Result<Vec<RangeInclusive<u16>>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (low, high) = part.split_once('-').unwrap_or((part, part));
            let low = parse_port(low)?;
            let high = parse_port(high)?;
            Ok(low..=high)
        })
        .collect()
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.trim()
        .parse::<u16>()
        .map_err(|e| Error::config(format!("invalid port {raw:?} ({e})")))
}
