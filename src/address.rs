use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// 64-bit hardware address of a radio module.
///
/// Parsing accepts 16 hex digits in any case, optionally split by `:` or `-`,
/// so `00:13:a2:00:41:fb:60:63` and `0013A20041FB6063` compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("hardware address `{0}` must have 16 hex digits")]
    Length(String),
    #[error("hardware address `{0}` contains a non-hex character")]
    Digit(String),
}

impl HardwareAddress {
    /// 64-bit broadcast address.
    pub const BROADCAST: HardwareAddress = HardwareAddress(0x0000_0000_0000_FFFF);
    /// Coordinator-side "unknown / everyone" address.
    pub const UNKNOWN: HardwareAddress = HardwareAddress(0xFFFF_FFFF_FFFF_FFFF);

    #[cfg(test)]
    pub const fn new(raw: u64) -> Self {
        HardwareAddress(raw)
    }

    /// Frames from these addresses are never associated with a table.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST || *self == Self::UNKNOWN
    }
}

impl FromStr for HardwareAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 16 {
            return Err(AddressError::Length(s.to_string()));
        }
        u64::from_str_radix(&digits, 16)
            .map(HardwareAddress)
            .map_err(|_| AddressError::Digit(s.to_string()))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl serde::Serialize for HardwareAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for HardwareAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
