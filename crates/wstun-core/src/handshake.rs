//! Server side of the SOCKS5 handshake run against each local application
//! connection.
//!
//! Only the "no authentication" method is accepted, and the greeting must be
//! exactly `05 01 00`. A rejected greeting or request gets no reply at all;
//! the caller is expected to close the connection.
//!
//! ```text
//! client                         wstun
//!   05 01 00            ──►
//!                       ◄──      05 00
//!   05 CMD 00 ATYP ADDR PORT ──►
//!                       ◄──      05 00 00 ATYP BND.ADDR BND.PORT
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::address::{self, Address};
use crate::error::ProtocolError;

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Reply to CONNECT: success, bound to 0.0.0.0:0.
pub const CONNECT_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

const GREETING: [u8; 3] = [SOCKS_VERSION, 0x01, METHOD_NO_AUTH];
const METHOD_REPLY: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

/// SOCKS5 request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }
}

/// Handshake progress. `Failed` is reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    MethodNegotiated,
    AddressReceived,
    Replied,
    Done,
    Failed,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub address: Address,
    pub command: Command,
}

/// Handshake settings.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Address advertised in the UDP ASSOCIATE reply.
    pub udp_relay: Address,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            udp_relay: Address::Ipv4(std::net::Ipv4Addr::LOCALHOST, 1080),
        }
    }
}

impl HandshakeConfig {
    /// The complete UDP ASSOCIATE reply: `05 00 00` followed by the encoded
    /// relay address.
    pub fn udp_reply(&self) -> Vec<u8> {
        let mut reply = vec![SOCKS_VERSION, 0x00, 0x00];
        reply.extend(self.udp_relay.to_bytes());
        reply
    }
}

/// One SOCKS5 negotiation against one connection.
pub struct Handshake<'a> {
    config: &'a HandshakeConfig,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(config: &'a HandshakeConfig) -> Self {
        Self {
            config,
            state: HandshakeState::Init,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drive the negotiation to completion. Any error leaves the state at
    /// [`HandshakeState::Failed`]; nothing is retried.
    pub async fn run<S>(&mut self, conn: &mut S) -> Result<HandshakeResult, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.negotiate(conn).await {
            Ok(result) => Ok(result),
            Err(e) => {
                debug!(state = ?self.state, error = %e, "socks5 handshake failed");
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    async fn negotiate<S>(&mut self, conn: &mut S) -> Result<HandshakeResult, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut greeting = [0u8; 3];
        conn.read_exact(&mut greeting).await?;
        if greeting[0] != SOCKS_VERSION {
            return Err(ProtocolError::MalformedVersion(greeting[0]));
        }
        if greeting != GREETING {
            return Err(ProtocolError::UnsupportedMethod {
                nmethods: greeting[1],
                method: greeting[2],
            });
        }

        conn.write_all(&METHOD_REPLY).await?;
        self.state = HandshakeState::MethodNegotiated;

        let mut header = [0u8; 3];
        conn.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(ProtocolError::MalformedVersion(header[0]));
        }

        let address = Address::read_from(conn).await?;
        if !address::validate(&address.to_bytes()) {
            return Err(ProtocolError::InvalidLength);
        }
        self.state = HandshakeState::AddressReceived;

        let command = match Command::from_byte(header[1]) {
            Some(Command::Connect) => {
                conn.write_all(&CONNECT_REPLY).await?;
                Command::Connect
            }
            Some(Command::UdpAssociate) => {
                conn.write_all(&self.config.udp_reply()).await?;
                Command::UdpAssociate
            }
            _ => return Err(ProtocolError::UnsupportedCommand(header[1])),
        };
        self.state = HandshakeState::Replied;

        conn.flush().await?;
        self.state = HandshakeState::Done;

        Ok(HandshakeResult { address, command })
    }
}

/// Run a handshake with `config` against `conn`.
pub async fn handshake<S>(
    conn: &mut S,
    config: &HandshakeConfig,
) -> Result<HandshakeResult, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Handshake::new(config).run(conn).await
}
