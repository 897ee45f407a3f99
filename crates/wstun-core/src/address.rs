//! SOCKS5 address codec (RFC 1928 section 5).
//!
//! Wire format: `[ATYP][DST.ADDR][DST.PORT]`
//!
//! - `ATYP = 0x01`: IPv4, 4 address bytes
//! - `ATYP = 0x03`: domain name, 1 length byte followed by that many bytes
//! - `ATYP = 0x04`: IPv6, 16 address bytes
//!
//! The port is always the final two bytes, big-endian. The same encoding is
//! written as the first bytes of every tunnel stream so the relay end knows
//! where to dial.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Longest possible encoded address: kind + length + 255-byte name + port.
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

const IPV4_ADDR_LEN: usize = 1 + 4 + 2;
const IPV6_ADDR_LEN: usize = 1 + 16 + 2;

/// A destination as carried in a SOCKS5 request or a tunnel stream header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    /// Build an address from a host string and port.
    ///
    /// Literal IPv4/IPv6 hosts (an IPv6 literal may be bracketed) use the
    /// fixed-length kinds; IPv4-mapped IPv6 literals collapse to IPv4.
    /// Anything else is a domain name of 1 to 255 bytes.
    pub fn encode(host: &str, port: u16) -> Result<Self, ProtocolError> {
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        match literal.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Ok(Address::Ipv4(ip, port)),
            Ok(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => Ok(Address::Ipv4(v4, port)),
                None => Ok(Address::Ipv6(ip, port)),
            },
            Err(_) => {
                if host.is_empty() {
                    return Err(ProtocolError::EmptyDomain);
                }
                if host.len() > 255 {
                    return Err(ProtocolError::DomainTooLong(host.len()));
                }
                Ok(Address::Domain(host.to_string(), port))
            }
        }
    }

    /// Read exactly one encoded address from `reader`.
    ///
    /// Reads the kind byte, then (for domains) the length byte, then only
    /// the remaining bytes that kind requires.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; MAX_ADDR_LEN];
        reader.read_exact(&mut buf[..1]).await?;

        let (start, len) = match buf[0] {
            ATYP_IPV4 => (1, IPV4_ADDR_LEN),
            ATYP_IPV6 => (1, IPV6_ADDR_LEN),
            ATYP_DOMAIN => {
                reader.read_exact(&mut buf[1..2]).await?;
                (2, 1 + 1 + buf[1] as usize + 2)
            }
            other => return Err(ProtocolError::UnknownAddressKind(other)),
        };

        reader.read_exact(&mut buf[start..len]).await?;
        Self::from_bytes(&buf[..len])
    }

    /// Parse a complete encoded address. The buffer must hold exactly one
    /// address, no more and no less.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        let kind = *buf.first().ok_or(ProtocolError::Truncated)?;
        if !matches!(kind, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) {
            return Err(ProtocolError::UnknownAddressKind(kind));
        }
        if !validate(buf) {
            return Err(ProtocolError::InvalidLength);
        }

        let port = port_from_tail(buf);
        let host = &buf[1..buf.len() - 2];

        match kind {
            ATYP_IPV4 => {
                let octets: [u8; 4] = host.try_into().map_err(|_| ProtocolError::InvalidLength)?;
                Ok(Address::Ipv4(Ipv4Addr::from(octets), port))
            }
            ATYP_IPV6 => {
                let octets: [u8; 16] =
                    host.try_into().map_err(|_| ProtocolError::InvalidLength)?;
                Ok(Address::Ipv6(Ipv6Addr::from(octets), port))
            }
            _ => {
                let name = std::str::from_utf8(&host[1..])
                    .map_err(|_| ProtocolError::InvalidDomain)?;
                Ok(Address::Domain(name.to_string(), port))
            }
        }
    }

    /// The ATYP byte for this address.
    pub fn kind(&self) -> u8 {
        match self {
            Address::Ipv4(..) => ATYP_IPV4,
            Address::Ipv6(..) => ATYP_IPV6,
            Address::Domain(..) => ATYP_DOMAIN,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    /// Length of the wire encoding.
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ipv4(..) => IPV4_ADDR_LEN,
            Address::Ipv6(..) => IPV6_ADDR_LEN,
            Address::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    /// Serialize to the wire encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.kind());
        match self {
            Address::Ipv4(ip, _) => out.extend_from_slice(&ip.octets()),
            Address::Ipv6(ip, _) => out.extend_from_slice(&ip.octets()),
            Address::Domain(name, _) => {
                // `encode` and `from_bytes` both cap names at 255 bytes.
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
        out.extend_from_slice(&self.port().to_be_bytes());
        out
    }
}

/// `host:port`, with IPv6 hosts bracketed. Used for logging and as the dial
/// target on the relay end.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => SocketAddrV4::new(*ip, *port).fmt(f),
            Address::Ipv6(ip, port) => SocketAddrV6::new(*ip, *port, 0, 0).fmt(f),
            Address::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// Whether `bytes` is exactly one encoded address: its total length must
/// match what the kind byte (and, for domains, the non-zero length byte)
/// declares.
pub fn validate(bytes: &[u8]) -> bool {
    let n = bytes.len();
    match bytes.first() {
        Some(&ATYP_IPV4) => n == IPV4_ADDR_LEN,
        Some(&ATYP_IPV6) => n == IPV6_ADDR_LEN,
        Some(&ATYP_DOMAIN) => n >= 2 && bytes[1] > 0 && n == 1 + 1 + bytes[1] as usize + 2,
        _ => false,
    }
}

/// Port from the final two bytes, identically for every address kind.
fn port_from_tail(bytes: &[u8]) -> u16 {
    let n = bytes.len();
    (u16::from(bytes[n - 2]) << 8) | u16::from(bytes[n - 1])
}
