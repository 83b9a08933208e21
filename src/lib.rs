#![warn(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

//! Concurrent ICMP echo sessions with callback or channel based reporting.

pub use event::{ChannelListener, PingEvent, PingListener};
pub use ping_config::{
    PingConfig, DEFAULT_INTERVAL, DEFAULT_PAYLOAD_SIZE, DEFAULT_TIMEOUT, DEFAULT_TTL, MAX_INTERVAL,
    MAX_PAYLOAD_SIZE, MAX_TIMEOUT,
};
pub use ping_error::{PingError, PingResult};
pub use ping_info::{PingId, PingInfo};
pub use pinger::{Pinger, PingerHandle, SocketType};

mod details;
mod event;
mod ping_config;
mod ping_error;
mod ping_info;
mod pinger;
