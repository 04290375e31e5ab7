use thiserror::Error;

#[derive(Error, Debug)]
pub enum Gb28181Error {
    #[error("SIP parse error: {0}")]
    Parse(String),

    #[error("SIP framing error: {0}")]
    Framing(String),

    #[error("media port pool exhausted")]
    PortPoolExhausted,

    #[error("media port {port} out of range [{start}, {end}]")]
    PortOutOfRange { port: u16, start: u16, end: u16 },

    #[error("media port {port} already occupied by {call_id}")]
    PortOccupied { port: u16, call_id: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("no TCP connection bound for device {0}")]
    PeerNotBound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("GB28181 service already running")]
    AlreadyRunning,

    #[error("GB28181 service not running")]
    NotRunning,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Gb28181Error>;

impl Gb28181Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Gb28181Error::Parse(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Gb28181Error::Storage(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Gb28181Error::Transport(msg.into())
    }
}
