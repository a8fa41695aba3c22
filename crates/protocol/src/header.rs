//! VLESS request header codec
//!
//! The header must arrive complete inside the first frame of a session;
//! there is no streaming decode. Layout:
//!
//! `version(1) | user_id(16) | opt_len(1) | options(opt_len) |
//!  command(1) | port(2, BE) | addr_type(1) | address(4 / 1+N / 16)`
//!
//! Everything after the address value is raw payload for the outbound
//! connection.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use uuid::Uuid;

/// Relay a TCP stream
pub const COMMAND_TCP: u8 = 0x01;

/// Relay UDP datagrams (part of the wire format, never served)
pub const COMMAND_UDP: u8 = 0x02;

/// IPv4 address, 4 bytes
pub const ADDR_TYPE_IPV4: u8 = 0x01;

/// Domain name, 1 length byte + name
pub const ADDR_TYPE_DOMAIN: u8 = 0x02;

/// IPv6 address, 16 bytes
pub const ADDR_TYPE_IPV6: u8 = 0x03;

/// Smallest buffer that can hold a complete header
/// (single-character domain, empty option block).
pub const MIN_HEADER_LEN: usize = 24;

/// Header decode failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header too short: {0} bytes")]
    TooShort(usize),

    #[error("user ID mismatch")]
    IdentifierMismatch,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed header: {0}")]
    Malformed(&'static str),
}

/// Relay mode requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

/// Destination host in one of the three wire encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => ip.fmt(f),
            Address::Domain(host) => f.write_str(host),
            Address::Ipv6(ip) => ip.fmt(f),
        }
    }
}

/// Decoded request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Protocol version, echoed back in the response header
    pub version: u8,

    /// Requested relay mode
    pub command: Command,

    /// Destination host
    pub address: Address,

    /// Destination port
    pub port: u16,

    /// Offset of the first payload byte after the address value
    pub payload_offset: usize,
}

impl RequestHeader {
    /// Decode a request header, authenticating the embedded user ID
    /// against `user_id` byte for byte.
    ///
    /// On `IdentifierMismatch` no other field of the buffer is decoded
    /// or exposed.
    pub fn decode(buf: &[u8], user_id: &Uuid) -> Result<Self, HeaderError> {
        if buf.len() < MIN_HEADER_LEN {
            return Err(HeaderError::TooShort(buf.len()));
        }

        let version = buf[0];

        if buf[1..17] != user_id.as_bytes()[..] {
            return Err(HeaderError::IdentifierMismatch);
        }

        // Option bytes are skipped; only their length matters.
        let opt_len = buf[17] as usize;
        let mut offset = 18 + opt_len;

        if buf.len() < offset + 4 {
            return Err(HeaderError::Malformed("truncated after option block"));
        }

        let command = match buf[offset] {
            COMMAND_TCP => Command::Tcp,
            COMMAND_UDP => Command::Udp,
            other => return Err(HeaderError::UnsupportedCommand(other)),
        };

        let port = u16::from_be_bytes([buf[offset + 1], buf[offset + 2]]);
        let addr_type = buf[offset + 3];
        offset += 4;

        let address = match addr_type {
            ADDR_TYPE_IPV4 => {
                let octets = take(buf, offset, 4)?;
                offset += 4;
                Address::Ipv4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
            }
            ADDR_TYPE_DOMAIN => {
                let len = take(buf, offset, 1)?[0] as usize;
                offset += 1;
                if len == 0 {
                    return Err(HeaderError::Malformed("empty domain name"));
                }
                let raw = take(buf, offset, len)?;
                let host = std::str::from_utf8(raw)
                    .map_err(|_| HeaderError::Malformed("domain is not valid UTF-8"))?;
                offset += len;
                Address::Domain(host.to_string())
            }
            ADDR_TYPE_IPV6 => {
                let raw = take(buf, offset, 16)?;
                offset += 16;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                Address::Ipv6(Ipv6Addr::from(octets))
            }
            other => return Err(HeaderError::UnsupportedAddressType(other)),
        };

        Ok(Self {
            version,
            command,
            address,
            port,
            payload_offset: offset,
        })
    }

    /// Raw bytes trailing the header in the frame it was decoded from.
    ///
    /// Empty when the client sent nothing beyond the header.
    pub fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        frame.get(self.payload_offset..).unwrap_or(&[])
    }

    /// The 2-byte response header: echoed version, empty option block.
    pub fn response(&self) -> [u8; 2] {
        [self.version, 0x00]
    }
}

fn take(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], HeaderError> {
    buf.get(offset..offset + len)
        .ok_or(HeaderError::Malformed("truncated address"))
}

/// Encode a request header the way a client does.
///
/// The option block is always empty and `payload` is appended verbatim
/// after the address value.
pub fn encode_request(
    user_id: &Uuid,
    command: Command,
    address: &Address,
    port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_HEADER_LEN + 32 + payload.len());

    buf.push(0x00); // version
    buf.extend_from_slice(user_id.as_bytes());
    buf.push(0x00); // no options
    buf.push(match command {
        Command::Tcp => COMMAND_TCP,
        Command::Udp => COMMAND_UDP,
    });
    buf.extend_from_slice(&port.to_be_bytes());

    match address {
        Address::Ipv4(ip) => {
            buf.push(ADDR_TYPE_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Domain(host) => {
            buf.push(ADDR_TYPE_DOMAIN);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host.as_bytes());
        }
        Address::Ipv6(ip) => {
            buf.push(ADDR_TYPE_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }

    buf.extend_from_slice(payload);
    buf
}
