//! Address canonicalization.
//!
//! The canonical form is the join key between the station directory and the geocode
//! cache. Both sides must go through [`canonicalize`] and nothing else: the rule has to
//! match the keys already present in historical caches.

use once_cell::sync::Lazy;
use regex::Regex;

static NUMBER_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(-?[0-9]+\.?[0-9]*)").unwrap());
static SPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

/// Normalizes an address string.
///
/// Commas become spaces, every number run gets a space on each side, runs of two
/// or more whitespace characters collapse to one space, and the result is trimmed.
///
/// ```
/// use station_votes::address::canonicalize;
///
/// assert_eq!(canonicalize("Main St   12,Springfield"), "Main St 12 Springfield");
/// assert_eq!(canonicalize("Herzl12"), "Herzl 12");
/// ```
pub fn canonicalize(address: &str) -> String {
    let no_commas = address.replace(',', " ");
    let spaced = NUMBER_RUN.replace_all(&no_commas, " ${1} ");
    let collapsed = SPACE_RUN.replace_all(&spaced, " ");
    collapsed.trim().to_string()
}

/// The address of a station, as sent to the geocoding provider.
pub fn full_address(address_name: &str, locality_name: &str) -> String {
    format!("{}, {}", address_name, locality_name)
}
