use crate::PingError;
use crate::PingResult;
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_TTL: u8 = 48;
pub const DEFAULT_PAYLOAD_SIZE: usize = 32;

pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Largest echo payload that fits into a single IPv4 datagram.
pub const MAX_PAYLOAD_SIZE: usize = 65_507;

/// Settings of one ping session. Immutable once the session is started.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct PingConfig {
    /// Time between two consecutive echo requests.
    pub interval: Duration,
    /// How long a single request may stay unanswered.
    pub timeout: Duration,
    pub payload_size: usize,
    pub ttl: u8,
    /// Number of requests after which the session stops by itself.
    pub max_sequence: u16,
    /// Bytes repeated over the payload. Empty means a zeroed payload.
    pub pattern: Vec<u8>,
    pub reverse_lookup: bool,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            ttl: DEFAULT_TTL,
            max_sequence: u16::MAX,
            pattern: Vec::new(),
            reverse_lookup: true,
        }
    }
}

impl PingConfig {
    pub fn validate(&self) -> PingResult<()> {
        if self.interval.is_zero() {
            return Err(PingError::InvalidConfig("interval must be positive".to_owned()));
        }
        if self.timeout.is_zero() {
            return Err(PingError::InvalidConfig("timeout must be positive".to_owned()));
        }
        if self.interval > MAX_INTERVAL {
            return Err(PingError::InvalidConfig(format!("interval {:?} exceeds {MAX_INTERVAL:?}", self.interval)));
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(PingError::InvalidConfig(format!("timeout {:?} exceeds {MAX_TIMEOUT:?}", self.timeout)));
        }
        if self.ttl == 0 {
            return Err(PingError::InvalidConfig("ttl must be positive".to_owned()));
        }
        if self.max_sequence == 0 {
            return Err(PingError::InvalidConfig("max_sequence must be at least 1".to_owned()));
        }
        if self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(PingError::InvalidConfig(format!(
                "payload_size {} exceeds {MAX_PAYLOAD_SIZE}",
                self.payload_size
            )));
        }
        Ok(())
    }

    pub(crate) fn build_payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; self.payload_size];
        if !self.pattern.is_empty() {
            for chunk in payload.chunks_mut(self.pattern.len()) {
                chunk.copy_from_slice(&self.pattern[..chunk.len()]);
            }
        }
        payload
    }
}
