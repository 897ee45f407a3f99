use thiserror::Error;

/// Errors in the SOCKS5 wire exchange with a local application, or in the
/// address header that opens every tunnel stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated input")]
    Truncated,

    #[error("malformed version byte: {0:#04x}")]
    MalformedVersion(u8),

    #[error("unsupported method negotiation: nmethods={nmethods:#04x} method={method:#04x}")]
    UnsupportedMethod { nmethods: u8, method: u8 },

    #[error("unknown address kind: {0:#04x}")]
    UnknownAddressKind(u8),

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("address length does not match its kind")]
    InvalidLength,

    #[error("domain name is not valid UTF-8")]
    InvalidDomain,

    #[error("domain name too long: {0} bytes (max 255)")]
    DomainTooLong(usize),

    #[error("domain name is empty")]
    EmptyDomain,

    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    }
}

/// Errors reaching the relay endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Errors from the multiplexed session carried over a transport.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stream open failed: {0}")]
    OpenFailed(String),

    #[error("session closed")]
    Closed,
}

/// Errors on the outbound side of a relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("destination {addr} unreachable: {source}")]
    DestinationUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error for the wstun crates.
#[derive(Debug, Error)]
pub enum WstunError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WstunError {
    /// Whether this error means the session underneath is gone (as opposed
    /// to a single stream failing).
    pub fn is_session_closed(&self) -> bool {
        matches!(self, WstunError::Session(SessionError::Closed))
    }
}

pub type WstunResult<T> = Result<T, WstunError>;
