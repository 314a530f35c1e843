use std::fmt;

use crate::model::{BookingId, LotId, SpotId, UserId};

/// Every way an engine operation can fail. Each variant aborts only the
/// current operation; nothing is retried internally and no state changes
/// on the error path.
#[derive(Debug)]
pub enum EngineError {
    LotNotFound(LotId),
    SpotNotFound(SpotId),
    BookingNotFound(BookingId),
    /// Another lot already uses this name or address.
    DuplicateLot {
        field: &'static str,
        value: String,
    },
    InvalidSpec(&'static str),
    InvalidCapacity(u32),
    /// Resize target is below the number of occupied spots; occupied spots
    /// are never evicted.
    CapacityBelowOccupancy {
        requested: u32,
        occupied: u32,
    },
    LotHasOccupants {
        lot_id: LotId,
        occupied: u32,
    },
    /// The user already has an active booking somewhere.
    AlreadyParked {
        user_id: UserId,
        booking_id: BookingId,
    },
    LotFull(LotId),
    NotYourBooking(BookingId),
    AlreadyReleased(BookingId),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short status label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::LotNotFound(_)
            | EngineError::SpotNotFound(_)
            | EngineError::BookingNotFound(_) => "not_found",
            EngineError::InvalidSpec(_)
            | EngineError::InvalidCapacity(_)
            | EngineError::LimitExceeded(_) => "invalid",
            EngineError::DuplicateLot { .. }
            | EngineError::CapacityBelowOccupancy { .. }
            | EngineError::LotHasOccupants { .. }
            | EngineError::AlreadyParked { .. }
            | EngineError::LotFull(_)
            | EngineError::NotYourBooking(_)
            | EngineError::AlreadyReleased(_) => "conflict",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::LotNotFound(id) => write!(f, "lot not found: {id}"),
            EngineError::SpotNotFound(id) => write!(f, "spot not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::DuplicateLot { field, value } => {
                write!(f, "a lot with this {field} already exists: {value:?}")
            }
            EngineError::InvalidSpec(msg) => write!(f, "invalid lot spec: {msg}"),
            EngineError::InvalidCapacity(n) => write!(f, "invalid capacity: {n}"),
            EngineError::CapacityBelowOccupancy {
                requested,
                occupied,
            } => write!(
                f,
                "cannot resize to {requested}: {occupied} spots are occupied"
            ),
            EngineError::LotHasOccupants { lot_id, occupied } => {
                write!(f, "cannot delete lot {lot_id}: {occupied} spots occupied")
            }
            EngineError::AlreadyParked {
                user_id,
                booking_id,
            } => write!(
                f,
                "user {user_id} already has an active booking: {booking_id}"
            ),
            EngineError::LotFull(id) => write!(f, "no spots available in lot {id}"),
            EngineError::NotYourBooking(id) => {
                write!(f, "booking {id} belongs to a different user")
            }
            EngineError::AlreadyReleased(id) => {
                write!(f, "booking {id} is already released")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
