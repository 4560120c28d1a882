use std::fmt;
use std::str::FromStr;

use eui48::ParseError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddress(eui48::MacAddress);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        MacAddress(eui48::MacAddress::new(bytes))
    }

    pub fn broadcast() -> Self {
        MacAddress(eui48::MacAddress::broadcast())
    }

    pub fn nil() -> Self {
        MacAddress(eui48::MacAddress::nil())
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0.to_array()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Multicast and broadcast addresses never bind an IP to a host.
    pub fn is_unicast(&self) -> bool {
        self.0.is_unicast() && !self.0.is_nil()
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        eui48::MacAddress::parse_str(s).map(Self)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex_string())
    }
}
