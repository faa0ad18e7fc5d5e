use std::io;

use thiserror::Error;

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("header too short")]
    HeaderTooShort,
    #[error("invalid user id")]
    InvalidCredential,
    #[error("unsupported command {0}, only TCP(1) and UDP(2) are allowed")]
    UnsupportedCommand(u8),
    #[error("unsupported address type")]
    UnsupportedAddressType,
    #[error("domain is not valid utf-8")]
    InvalidDomain,
    #[error("UDP only supports DNS (port 53), got port {0}")]
    UnsupportedUdpPort(u16),
    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4(String),
    #[error("failed to resolve {0}")]
    Resolution(String),
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),
    #[error("DoH request failed: {0}")]
    Doh(String),
    #[error("frame of {0} bytes exceeds the 2-byte length prefix")]
    FrameTooLarge(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl From<worker::Error> for TunnelError {
    fn from(e: worker::Error) -> Self {
        TunnelError::Transport(io::Error::other(e.to_string()))
    }
}
