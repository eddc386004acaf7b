//! Connection state and reconnection policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Short status label for display
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    /// True while a connection exists or is being established
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lock-free cell readable from any clock
#[derive(Debug)]
pub struct ConnectionStateCell(AtomicU8);

impl ConnectionStateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one
    pub fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

/// When and how fast to reconnect after a lost or failed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Cap for the doubling backoff; equal to `interval` for a fixed delay
    #[serde(with = "secs")]
    pub max_interval: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
            max_interval: interval,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(crate::constants::DEFAULT_RECONNECT_INTERVAL_SECS),
            max_interval: Duration::from_secs(crate::constants::DEFAULT_MAX_RECONNECT_INTERVAL_SECS),
        }
    }
}

/// Exponential backoff state for consecutive failed attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let max = policy.max_interval.max(policy.interval);
        Self {
            base: policy.interval,
            max,
            current: policy.interval,
        }
    }

    /// Delay before the next attempt; doubles the following one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the base interval after a successful connect
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("interval must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_swap() {
        let cell = ConnectionStateCell::default();
        assert_eq!(cell.load(), ConnectionState::Disconnected);
        assert_eq!(cell.swap(ConnectionState::Connecting), ConnectionState::Disconnected);
        assert_eq!(cell.swap(ConnectionState::Connected), ConnectionState::Connecting);
        assert_eq!(cell.load(), ConnectionState::Connected);
        assert!(cell.load().is_active());
    }

    #[test]
    fn test_labels() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Connecting.label(), "connecting");
        assert_eq!(ConnectionState::Disconnected.label(), "disconnected");
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = ReconnectPolicy {
            enabled: true,
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
        };
        let mut backoff = Backoff::new(&policy);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_backoff() {
        let mut backoff = Backoff::new(&ReconnectPolicy::fixed(Duration::from_millis(250)));
        for _ in 0..4 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        }
    }
}
