//! Compact Bluetooth device address used for keying and display.
//!
//! The canonical textual form is contiguous lowercase hex
//! (`"aabbccddeeff"`); that is what the console table, alias lookups, and
//! webhook payloads carry. Parsing additionally accepts the colon-separated
//! form for command-line input.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth device address stored as a compact 6-byte array.
///
/// `Copy` and cheap to hash, so it can be used as a map key on the
/// event-delivery path without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors returned when parsing an address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid address: expected 12 hex digits, got {0}")]
    InvalidLength(usize),
    #[error("invalid address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        if !digits.is_ascii() {
            return Err(ParseMacError::InvalidHex(s.to_string()));
        }
        if digits.len() != 12 {
            return Err(ParseMacError::InvalidLength(digits.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, pair) in digits.as_bytes().chunks(2).enumerate() {
            let pair =
                std::str::from_utf8(pair).map_err(|_| ParseMacError::InvalidHex(s.to_string()))?;
            bytes[i] =
                u8::from_str_radix(pair, 16).map_err(|_| ParseMacError::InvalidHex(pair.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<MacAddress> for bluer::Address {
    fn from(addr: MacAddress) -> Self {
        bluer::Address(addr.0)
    }
}
