//! IPv4 addresses and ports.

use socket2::SockAddr;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// Error returned when text is not a dotted-quad IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IPv4 address: {0:?}")]
pub struct AddrParseError(String);

/// A validated IPv4 address.
///
/// Built from dotted-quad text between 7 (`0.0.0.0`) and 15
/// (`255.255.255.255`) characters long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    /// `0.0.0.0`, every local interface.
    pub const ANY: Ipv4Address = Ipv4Address(Ipv4Addr::UNSPECIFIED);
    /// `127.0.0.1`.
    pub const LOOPBACK: Ipv4Address = Ipv4Address(Ipv4Addr::LOCALHOST);

    pub fn parse(text: &str) -> Result<Self, AddrParseError> {
        if !(7..=15).contains(&text.len()) {
            return Err(AddrParseError(text.to_string()));
        }
        text.parse::<Ipv4Addr>()
            .map(Ipv4Address)
            .map_err(|_| AddrParseError(text.to_string()))
    }

    pub fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }
}

impl FromStr for Ipv4Address {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ipv4Address::parse(s)
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Ipv4Address(addr)
    }
}

impl From<Ipv4Address> for Ipv4Addr {
    fn from(addr: Ipv4Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A TCP port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(pub u16);

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Port(port)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) fn socket_addr(ip: Ipv4Address, port: Port) -> SocketAddrV4 {
    SocketAddrV4::new(ip.0, port.0)
}

pub(crate) fn sock_addr(ip: Ipv4Address, port: Port) -> SockAddr {
    SockAddr::from(socket_addr(ip, port))
}
