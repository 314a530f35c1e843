//! Admission limits. Everything here is checked before any mutation, so a
//! hostile or buggy caller cannot grow unbounded state. Field lengths match
//! the column widths of the upstream schema this engine replaces.

pub const MAX_LOTS: usize = 10_000;

/// Per-lot spot cap. Kept below 10^6 so spot ordinals always fit the fixed
/// width of `spotnum::encode`.
pub const MAX_CAPACITY: u32 = 100_000;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_ADDRESS_LEN: usize = 200;
pub const MAX_VEHICLE_LEN: usize = 20;

pub const MIN_PINCODE_LEN: usize = 4;
pub const MAX_PINCODE_LEN: usize = 10;
