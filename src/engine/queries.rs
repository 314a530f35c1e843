//! Read-only views over engine state. Queries take the lot read lock, so
//! they never observe a reconciliation or booking mid-flight.

use crate::model::*;
use crate::spotnum;

use super::{Engine, EngineError, SharedLotState};

fn lot_info(lot: &LotState) -> LotInfo {
    let occ = lot.occupancy();
    LotInfo {
        id: lot.id,
        name: lot.name.clone(),
        address: lot.address.clone(),
        pincode: lot.pincode.clone(),
        price_per_hour: lot.price_per_hour,
        capacity: lot.capacity,
        available: occ.available,
        occupied: occ.occupied,
    }
}

impl Engine {
    /// Free/occupied counts for one lot.
    pub async fn occupancy(&self, lot_id: LotId) -> Result<Occupancy, EngineError> {
        let rs = self
            .get_lot(&lot_id)
            .ok_or(EngineError::LotNotFound(lot_id))?;
        let lot = rs.read().await;
        Ok(lot.occupancy())
    }

    /// The spot a reserve call would pick right now: lowest ordinal among
    /// Available spots. Advisory only; a concurrent reserve may take it.
    pub async fn first_available(&self, lot_id: LotId) -> Result<Option<SpotInfo>, EngineError> {
        let rs = self
            .get_lot(&lot_id)
            .ok_or(EngineError::LotNotFound(lot_id))?;
        let lot = rs.read().await;
        Ok(lot.first_available().map(|s| SpotInfo {
            id: s.id,
            lot_id,
            ordinal: s.ordinal,
            ident: spotnum::encode(s.ordinal),
            state: s.state,
        }))
    }

    pub async fn lot(&self, lot_id: LotId) -> Result<LotInfo, EngineError> {
        let rs = self
            .get_lot(&lot_id)
            .ok_or(EngineError::LotNotFound(lot_id))?;
        let lot = rs.read().await;
        Ok(lot_info(&lot))
    }

    /// All lots with their occupancy, sorted by id. Collects the Arcs
    /// before awaiting so no DashMap shard lock is held across a lock
    /// acquisition.
    pub async fn list_lots(&self) -> Vec<LotInfo> {
        let arcs: Vec<SharedLotState> = self.lots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for rs in arcs {
            let lot = rs.read().await;
            out.push(lot_info(&lot));
        }
        out.sort_by_key(|l| l.id);
        out
    }

    /// Every spot in the lot with its display identifier, in ordinal order.
    pub async fn spots(&self, lot_id: LotId) -> Result<Vec<SpotInfo>, EngineError> {
        let rs = self
            .get_lot(&lot_id)
            .ok_or(EngineError::LotNotFound(lot_id))?;
        let lot = rs.read().await;
        Ok(lot
            .spots
            .iter()
            .map(|s| SpotInfo {
                id: s.id,
                lot_id,
                ordinal: s.ordinal,
                ident: spotnum::encode(s.ordinal),
                state: s.state,
            })
            .collect())
    }

    /// Look a spot up by its display identifier within one lot. Accepts
    /// both padded ("S000007") and legacy unpadded ("S7") forms.
    pub async fn find_spot(
        &self,
        lot_id: LotId,
        ident: &str,
    ) -> Result<Option<SpotInfo>, EngineError> {
        let ordinal = spotnum::decode_or_lowest(ident);
        let rs = self
            .get_lot(&lot_id)
            .ok_or(EngineError::LotNotFound(lot_id))?;
        let lot = rs.read().await;
        Ok(lot
            .spots
            .iter()
            .find(|s| s.ordinal == ordinal)
            .map(|s| SpotInfo {
                id: s.id,
                lot_id,
                ordinal: s.ordinal,
                ident: spotnum::encode(s.ordinal),
                state: s.state,
            }))
    }

    pub fn get_booking(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        self.bookings
            .get(&booking_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::BookingNotFound(booking_id))
    }

    /// The user's active booking, if any.
    pub fn active_booking_for_user(&self, user_id: UserId) -> Option<Booking> {
        let booking_id = *self.active_by_user.get(&user_id)?.value();
        self.bookings.get(&booking_id).map(|b| b.value().clone())
    }

    /// The active booking holding a given spot, if any.
    pub async fn active_booking_for_spot(
        &self,
        spot_id: SpotId,
    ) -> Result<Option<Booking>, EngineError> {
        let lot_id = self
            .lot_for_spot(&spot_id)
            .ok_or(EngineError::SpotNotFound(spot_id))?;
        let rs = self
            .get_lot(&lot_id)
            .ok_or(EngineError::LotNotFound(lot_id))?;
        let lot = rs.read().await;
        let spot = lot.spot(spot_id).ok_or(EngineError::SpotNotFound(spot_id))?;
        match spot.state {
            SpotState::Occupied { booking_id, .. } => {
                Ok(self.bookings.get(&booking_id).map(|b| b.value().clone()))
            }
            SpotState::Available => Ok(None),
        }
    }

    /// All of a user's bookings, newest first (active booking on top).
    pub fn booking_history(&self, user_id: UserId) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| std::cmp::Reverse(b.start_ms));
        out
    }
}
