use std::{error::Error, fmt};

pub type PingResult<T> = std::result::Result<T, PingError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PingError {
    /// Rejected by `Pinger::start` before any network activity.
    InvalidConfig(String),
    ResolutionFailed(String),
    MalformedPacket(String),
    /// An echo reply carried an identifier no live session is registered under.
    UnknownSession(u16),
    SendFailed(String),
    /// The socket of an address family is unusable.
    Transport(String),
    Io(String),
}

impl PingError {
    fn kind_str(&self) -> &'static str {
        match self {
            PingError::InvalidConfig(_) => "invalid config",
            PingError::ResolutionFailed(_) => "resolution failed",
            PingError::MalformedPacket(_) => "malformed packet",
            PingError::UnknownSession(_) => "unknown session",
            PingError::SendFailed(_) => "send failed",
            PingError::Transport(_) => "transport failure",
            PingError::Io(_) => "io error",
        }
    }
}

impl fmt::Display for PingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "PingError({})", self.kind_str())?;
        match self {
            PingError::UnknownSession(identifier) => write!(f, ": identifier {identifier:#06x}")?,
            PingError::InvalidConfig(message)
            | PingError::ResolutionFailed(message)
            | PingError::MalformedPacket(message)
            | PingError::SendFailed(message)
            | PingError::Transport(message)
            | PingError::Io(message) => {
                if !message.is_empty() {
                    write!(f, ": {message}")?;
                }
            }
        }
        Ok(())
    }
}

impl Error for PingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl From<std::io::Error> for PingError {
    fn from(error: std::io::Error) -> PingError {
        PingError::Io(error.to_string())
    }
}
