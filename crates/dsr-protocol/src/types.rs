//! Core protocol types

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a node in the ad-hoc network
///
/// Stored as a 32-bit value and rendered as a dotted quad. Serialized as
/// its string form so configuration files stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(u32);

impl Address {
    /// Limited broadcast address
    pub const BROADCAST: Address = Address(u32::MAX);

    /// Create an address from its raw value
    pub const fn new(raw: u32) -> Self {
        Address(raw)
    }

    /// Create an address from four octets
    pub const fn from_octets(a: u8, b: u8, c: u8, d: u8) -> Self {
        Address(u32::from_be_bytes([a, b, c, d]))
    }

    /// Raw value of this address
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn octets(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 4];
        let mut parts = s.trim().split('.');

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| ProtocolError::InvalidAddress(s.to_string()))?;
            *octet = part
                .parse()
                .map_err(|_| ProtocolError::InvalidAddress(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ProtocolError::InvalidAddress(s.to_string()));
        }

        Ok(Address(u32::from_be_bytes(octets)))
    }
}

impl TryFrom<String> for Address {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

impl From<u32> for Address {
    fn from(raw: u32) -> Self {
        Address(raw)
    }
}

/// Link-layer (MAC) address of a neighbor's interface
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HwAddr([u8; 6]);

impl HwAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        HwAddr(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwAddr({})", self)
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}
