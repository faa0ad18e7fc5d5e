//! VLESS request header decoding.
//!
//! ```text
//! +---------+------------+-------+---------+---------+------+-----------+---------+---------+
//! | version | credential | n_opt | options | command | port | addr type | address | payload |
//! |    1    |     16     |   1   |    N    |    1    |  2   |     1     |   var   |   ...   |
//! +---------+------------+-------+---------+---------+------+-----------+---------+---------+
//! ```

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Buf;

use crate::error::{Result, TunnelError};
use crate::ext::BufExt;

pub const MIN_HEADER_LEN: usize = 24;
pub const COMMAND_TCP: u8 = 1;
pub const COMMAND_UDP: u8 = 2;
pub const ADDRESS_TYPE_IPV4: u8 = 1;
pub const ADDRESS_TYPE_DOMAIN: u8 = 2;
pub const ADDRESS_TYPE_IPV6: u8 = 3;
pub const STATUS_OK: u8 = 0;
pub const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

impl TryFrom<u8> for Command {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            COMMAND_TCP => Ok(Command::Tcp),
            COMMAND_UDP => Ok(Command::Udp),
            other => Err(TunnelError::UnsupportedCommand(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for Address {
    /// IPv6 renders every group with leading zeros stripped and no `::`
    /// shortening, e.g. `2001:db8:0:0:0:0:0:1`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{ip}"),
            Address::Domain(domain) => f.write_str(domain),
            Address::Ipv6(ip) => {
                for (i, group) in ip.segments().iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{group:x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Two byte acknowledgement sent ahead of the first reply.
pub type ResponseHeader = [u8; 2];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub command: Command,
    pub address: Address,
    pub port: u16,
    /// Index into the parsed buffer where application data starts.
    pub payload_offset: usize,
}

impl Header {
    pub fn parse(buf: &[u8], credential: &str) -> Result<Self> {
        if buf.len() < MIN_HEADER_LEN {
            return Err(TunnelError::HeaderTooShort);
        }
        let mut cur = buf;

        let version = cur.read_u8()?;

        let user_id: [u8; 16] = cur.read_array()?;
        if format_credential(&user_id) != credential {
            return Err(TunnelError::InvalidCredential);
        }

        let options_len = cur.read_u8()? as usize;
        cur.skip(options_len)?;

        let command = Command::try_from(cur.read_u8()?)?;
        let port = cur.read_u16()?;

        let address = match cur.read_u8()? {
            ADDRESS_TYPE_IPV4 => Address::Ipv4(Ipv4Addr::from(cur.read_u32()?)),
            ADDRESS_TYPE_DOMAIN => {
                let length = cur.read_u8()?;
                Address::Domain(cur.read_string(length as usize)?)
            }
            ADDRESS_TYPE_IPV6 => Address::Ipv6(Ipv6Addr::from(cur.read_array::<16>()?)),
            _ => return Err(TunnelError::UnsupportedAddressType),
        };

        Ok(Header {
            version,
            command,
            address,
            port,
            payload_offset: buf.len() - cur.remaining(),
        })
    }

    pub fn response(&self) -> ResponseHeader {
        [self.version, STATUS_OK]
    }
}

/// Renders 16 raw bytes as a lowercase 8-4-4-4-12 UUID string.
pub fn format_credential(bytes: &[u8; 16]) -> String {
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

/// Canonical form of a configured credential, or `None` if it is not a UUID.
pub fn normalize_credential(user_id: &str) -> Option<String> {
    let lower = user_id.trim().to_ascii_lowercase();
    let bytes: [u8; 16] = hex::decode(lower.replace('-', "")).ok()?.try_into().ok()?;
    let canonical = format_credential(&bytes);
    (canonical == lower).then_some(canonical)
}
