use std::fmt;

use serde::{Deserialize, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(LotId);
id_type!(SpotId);
id_type!(BookingId);
id_type!(UserId);

/// A spot is either free or held by exactly one user through exactly one
/// active booking. The occupant fields exist only in the Occupied arm, so
/// "occupant present iff occupied" holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotState {
    Available,
    Occupied { user_id: UserId, booking_id: BookingId },
}

/// One parking space. The ordinal is its display position within the lot
/// (1..=capacity, contiguous); it is reassigned on resize, the identity never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    pub id: SpotId,
    pub ordinal: u32,
    pub state: SpotState,
}

impl Spot {
    pub fn new(id: SpotId, ordinal: u32) -> Self {
        Self {
            id,
            ordinal,
            state: SpotState::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, SpotState::Available)
    }
}

/// Free/occupied counts for one lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occupancy {
    pub available: u32,
    pub occupied: u32,
}

#[derive(Debug, Clone)]
pub struct LotState {
    pub id: LotId,
    pub name: String,
    pub address: String,
    pub pincode: String,
    pub price_per_hour: f64,
    /// Target spot count. Equal to `spots.len()` whenever no resize is in flight.
    pub capacity: u32,
    /// All spots, sorted by ordinal.
    pub spots: Vec<Spot>,
}

impl LotState {
    pub fn new(
        id: LotId,
        name: String,
        address: String,
        pincode: String,
        price_per_hour: f64,
        capacity: u32,
    ) -> Self {
        Self {
            id,
            name,
            address,
            pincode,
            price_per_hour,
            capacity,
            spots: Vec::with_capacity(capacity as usize),
        }
    }

    /// Insert a spot maintaining sort order by ordinal.
    pub fn insert_spot(&mut self, spot: Spot) {
        let pos = self
            .spots
            .binary_search_by_key(&spot.ordinal, |s| s.ordinal)
            .unwrap_or_else(|e| e);
        self.spots.insert(pos, spot);
    }

    pub fn spot(&self, id: SpotId) -> Option<&Spot> {
        self.spots.iter().find(|s| s.id == id)
    }

    pub fn spot_mut(&mut self, id: SpotId) -> Option<&mut Spot> {
        self.spots.iter_mut().find(|s| s.id == id)
    }

    /// Lowest-ordinal Available spot, if any. Spots are kept sorted by
    /// ordinal, so the first Available one wins.
    pub fn first_available(&self) -> Option<&Spot> {
        self.spots.iter().find(|s| s.is_available())
    }

    pub fn occupancy(&self) -> Occupancy {
        let occupied = self.spots.iter().filter(|s| !s.is_available()).count() as u32;
        Occupancy {
            available: self.spots.len() as u32 - occupied,
            occupied,
        }
    }

    pub fn occupied_count(&self) -> u32 {
        self.occupancy().occupied
    }
}

/// A time-bounded occupancy record. Active while `end_ms` is None; once
/// closed it is immutable history. `cost` is set exactly once, at close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub lot_id: LotId,
    pub spot_id: SpotId,
    pub vehicle: String,
    pub start_ms: Ms,
    pub end_ms: Option<Ms>,
    pub cost: Option<f64>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.end_ms.is_none()
    }
}

/// The exact set of spot mutations that moves a lot to `new_capacity`.
/// Computed from an immutable snapshot before anything is applied, and
/// committed as one WAL record so resize is all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub new_capacity: u32,
    /// New spots with their final ordinals.
    pub create: Vec<(SpotId, u32)>,
    /// Spots removed; only Available spots ever appear here.
    pub delete: Vec<SpotId>,
    /// Surviving spots whose ordinal changes, with the new ordinal.
    pub renumber: Vec<(SpotId, u32)>,
}

impl ReconciliationPlan {
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty() && self.renumber.is_empty()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LotCreated {
        id: LotId,
        name: String,
        address: String,
        pincode: String,
        price_per_hour: f64,
        capacity: u32,
        /// Spot identities in ordinal order (ordinals 1..=capacity).
        spot_ids: Vec<SpotId>,
    },
    /// Field updates and spot reconciliation committed as one unit; a
    /// resize-only call carries the unchanged fields, a field-only update
    /// carries a no-op plan.
    LotReconciled {
        lot_id: LotId,
        name: String,
        address: String,
        pincode: String,
        price_per_hour: f64,
        plan: ReconciliationPlan,
    },
    LotDeleted {
        id: LotId,
    },
    BookingOpened {
        id: BookingId,
        user_id: UserId,
        lot_id: LotId,
        spot_id: SpotId,
        vehicle: String,
        start_ms: Ms,
    },
    BookingClosed {
        id: BookingId,
        lot_id: LotId,
        end_ms: Ms,
        cost: f64,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LotInfo {
    pub id: LotId,
    pub name: String,
    pub address: String,
    pub pincode: String,
    pub price_per_hour: f64,
    pub capacity: u32,
    pub available: u32,
    pub occupied: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotInfo {
    pub id: SpotId,
    pub lot_id: LotId,
    pub ordinal: u32,
    /// Display identifier, e.g. "S000003".
    pub ident: String,
    pub state: SpotState,
}
