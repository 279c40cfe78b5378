//! Device address aliasing.
//!
//! Aliases map a hardware address to a human-chosen name that overrides
//! whatever the device advertises, making individual beacons easy to pick
//! out on the console and in notifications.

use crate::advertisement::LocalName;
use crate::mac_address::{MacAddress, ParseMacError};
use std::collections::HashMap;
use thiserror::Error;

/// Mapping from device address to a human-readable name.
pub type AliasMap = HashMap<MacAddress, String>;

/// A parsed alias mapping a device address to a human-readable name.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub address: MacAddress,
    pub name: String,
}

/// Errors returned when parsing an alias argument.
#[derive(Error, Debug, PartialEq)]
pub enum ParseAliasError {
    #[error("invalid alias: expected format ADDRESS=NAME")]
    MissingSeparator,
    #[error(transparent)]
    Address(#[from] ParseMacError),
}

/// Parse an alias from a string in the format `ADDRESS=NAME`.
///
/// # Example
/// ```
/// use beacon_listener::alias::parse_alias;
///
/// let alias = parse_alias("aa:bb:cc:dd:ee:ff=Kitchen").unwrap();
/// assert_eq!(alias.address.to_string(), "aabbccddeeff");
/// assert_eq!(alias.name, "Kitchen");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, ParseAliasError> {
    let (address, name) = src
        .split_once('=')
        .ok_or(ParseAliasError::MissingSeparator)?;
    Ok(Alias {
        address: address.trim().parse()?,
        name: name.to_string(),
    })
}

/// Convert parsed aliases into a lookup map.
pub fn to_map(aliases: &[Alias]) -> AliasMap {
    aliases
        .iter()
        .map(|alias| (alias.address, alias.name.clone()))
        .collect()
}

/// Resolve the name shown for a device: the alias when configured, the
/// advertised name otherwise.
pub fn resolve_name<'a>(
    address: &MacAddress,
    advertised: &'a str,
    aliases: &'a AliasMap,
) -> &'a str {
    aliases.get(address).map(String::as_str).unwrap_or(advertised)
}

/// Resolve the name attached to an outgoing notification: the alias when
/// configured, the advertised name when one was decoded, nothing otherwise.
pub fn notification_name<'a>(
    address: &MacAddress,
    name: &'a LocalName,
    aliases: &'a AliasMap,
) -> Option<&'a str> {
    aliases
        .get(address)
        .map(String::as_str)
        .or_else(|| name.is_known().then(|| name.as_str()))
}
