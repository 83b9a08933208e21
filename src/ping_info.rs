use crate::PingerHandle;
use std::net::IpAddr;
use std::time::Duration;

/// Identifies one ping session. Unique within the process, never reused.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PingId(pub(crate) u32);

impl From<PingId> for u32 {
    fn from(id: PingId) -> Self {
        id.0
    }
}

impl std::fmt::Display for PingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a session as handed to the listener.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct PingInfo {
    pub ping_id: PingId,
    /// The host exactly as passed to `Pinger::start`.
    pub remote_host: String,
    /// `None` until the host is resolved.
    pub remote_addr: Option<IpAddr>,
    pub reverse_dns: Option<String>,
    pub payload_size: usize,
    pub ttl: u8,
    pub timeout: Duration,
    /// Does not keep the engine alive.
    pub pinger: PingerHandle,
}

impl PingInfo {
    /// Stops this session. Safe to call from inside a listener callback.
    pub fn stop(&self) {
        self.pinger.stop(self.ping_id);
    }
}

impl std::fmt::Display for PingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.ping_id, self.remote_host)?;
        if let Some(addr) = self.remote_addr {
            write!(f, " ({addr})")?;
        }
        if let Some(name) = &self.reverse_dns {
            write!(f, " [{name}]")?;
        }
        Ok(())
    }
}
