//! Display encoding for spot ordinals.
//!
//! Spots are identified externally by strings like `"S000042"`. The ordinal
//! stays an integer everywhere inside the engine; this module is the only
//! place that converts to and from the display form. Zero-padding keeps
//! lexicographic order of identifiers aligned with numeric order of
//! ordinals for every ordinal the engine can assign.

use std::fmt;

/// Padding width. [`crate::limits::MAX_CAPACITY`] stays below 10^6, so six
/// digits never truncate.
const WIDTH: usize = 6;

/// The identifier was not produced by [`encode`] and is not a recognizable
/// legacy form either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidIdentifier(pub String);

impl fmt::Display for InvalidIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid spot identifier: {:?}", self.0)
    }
}

impl std::error::Error for InvalidIdentifier {}

/// Encode an ordinal as its display identifier, e.g. `encode(7) == "S000007"`.
pub fn encode(ordinal: u32) -> String {
    format!("S{ordinal:0width$}", width = WIDTH)
}

/// Decode a display identifier back to its ordinal.
///
/// Accepts anything [`encode`] produced, plus the unpadded legacy forms
/// `"S7"` and `"s7"` (the tag is case-insensitive). Fails on a missing tag,
/// a non-digit payload, or an ordinal of zero.
pub fn decode(ident: &str) -> Result<u32, InvalidIdentifier> {
    let digits = ident
        .strip_prefix('S')
        .or_else(|| ident.strip_prefix('s'))
        .ok_or_else(|| InvalidIdentifier(ident.to_string()))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidIdentifier(ident.to_string()));
    }
    let ordinal: u32 = digits
        .parse()
        .map_err(|_| InvalidIdentifier(ident.to_string()))?;
    if ordinal == 0 {
        return Err(InvalidIdentifier(ident.to_string()));
    }
    Ok(ordinal)
}

/// Tolerant decode for foreign or legacy data: a malformed identifier maps
/// to ordinal 0, which sorts below every real ordinal and matches no spot.
pub fn decode_or_lowest(ident: &str) -> u32 {
    decode(ident).unwrap_or(0)
}
