use std::time::Instant;

use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::observability::record_op;

use super::reconcile::plan_resize;
use super::{Engine, EngineError};

/// Cost is rupees-and-paise style: two decimal places, half-up.
fn round_cost(cost: f64) -> f64 {
    (cost * 100.0).round() / 100.0
}

fn validate_lot_fields(
    name: &str,
    address: &str,
    pincode: &str,
    price_per_hour: f64,
) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidSpec("lot name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("lot name too long"));
    }
    if address.is_empty() {
        return Err(EngineError::InvalidSpec("lot address must not be empty"));
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(EngineError::LimitExceeded("lot address too long"));
    }
    if pincode.len() < MIN_PINCODE_LEN
        || pincode.len() > MAX_PINCODE_LEN
        || !pincode.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(EngineError::InvalidSpec(
            "pincode must be 4 to 10 ASCII digits",
        ));
    }
    if !price_per_hour.is_finite() || price_per_hour <= 0.0 {
        return Err(EngineError::InvalidSpec(
            "price per hour must be positive and finite",
        ));
    }
    Ok(())
}

impl Engine {
    /// Create a lot and its spots at ordinals `1..=capacity`, as one
    /// committed unit.
    pub async fn create_lot(
        &self,
        name: String,
        address: String,
        pincode: String,
        price_per_hour: f64,
        capacity: u32,
    ) -> Result<LotInfo, EngineError> {
        let started = Instant::now();
        let result = self
            .create_lot_inner(name, address, pincode, price_per_hour, capacity)
            .await;
        record_op(
            "create_lot",
            result.as_ref().map_or_else(|e| e.label(), |_| "ok"),
            started,
        );
        result
    }

    async fn create_lot_inner(
        &self,
        name: String,
        address: String,
        pincode: String,
        price_per_hour: f64,
        capacity: u32,
    ) -> Result<LotInfo, EngineError> {
        if self.lots.len() >= MAX_LOTS {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        validate_lot_fields(&name, &address, &pincode, price_per_hour)?;
        if capacity == 0 {
            return Err(EngineError::InvalidCapacity(capacity));
        }
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }

        let id = self.alloc_lot_id();

        // Claim both uniqueness indexes before anything else; the entry
        // insertion is the atomic arbiter between concurrent creates.
        match self.names.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::DuplicateLot {
                    field: "name",
                    value: name,
                });
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }
        match self.addresses.entry(address.clone()) {
            Entry::Occupied(_) => {
                self.names.remove(&name);
                return Err(EngineError::DuplicateLot {
                    field: "address",
                    value: address,
                });
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let spot_ids: Vec<SpotId> = (0..capacity).map(|_| self.alloc_spot_id()).collect();
        let event = Event::LotCreated {
            id,
            name: name.clone(),
            address: address.clone(),
            pincode: pincode.clone(),
            price_per_hour,
            capacity,
            spot_ids: spot_ids.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.names.remove(&name);
            self.addresses.remove(&address);
            return Err(e);
        }

        self.install_lot(
            id,
            name.clone(),
            address.clone(),
            pincode.clone(),
            price_per_hour,
            capacity,
            &spot_ids,
        );
        self.notify.send(id, &event);
        metrics::gauge!(crate::observability::LOTS_ACTIVE).set(self.lots.len() as f64);
        info!(lot = id.0, capacity, "lot created");

        Ok(LotInfo {
            id,
            name,
            address,
            pincode,
            price_per_hour,
            capacity,
            available: capacity,
            occupied: 0,
        })
    }

    /// Resize a lot's spot inventory, keeping every other field unchanged.
    /// Returns the committed plan (empty when `new_capacity` already holds).
    pub async fn resize_lot(
        &self,
        lot_id: LotId,
        new_capacity: u32,
    ) -> Result<ReconciliationPlan, EngineError> {
        let started = Instant::now();
        let result = self.resize_lot_inner(lot_id, None, new_capacity).await;
        record_op(
            "resize_lot",
            result.as_ref().map_or_else(|e| e.label(), |_| "ok"),
            started,
        );
        result
    }

    /// Update name/address/pincode/price and resize in one atomic commit.
    pub async fn update_lot(
        &self,
        lot_id: LotId,
        name: String,
        address: String,
        pincode: String,
        price_per_hour: f64,
        new_capacity: u32,
    ) -> Result<ReconciliationPlan, EngineError> {
        let started = Instant::now();
        let result = self
            .resize_lot_inner(
                lot_id,
                Some((name, address, pincode, price_per_hour)),
                new_capacity,
            )
            .await;
        record_op(
            "update_lot",
            result.as_ref().map_or_else(|e| e.label(), |_| "ok"),
            started,
        );
        result
    }

    async fn resize_lot_inner(
        &self,
        lot_id: LotId,
        fields: Option<(String, String, String, f64)>,
        new_capacity: u32,
    ) -> Result<ReconciliationPlan, EngineError> {
        if new_capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if let Some((name, address, pincode, price)) = &fields {
            validate_lot_fields(name, address, pincode, *price)?;
        }

        let mut guard = self.lock_lot_write(lot_id).await?;

        let (name, address, pincode, price_per_hour) = match fields {
            Some(f) => f,
            None => (
                guard.name.clone(),
                guard.address.clone(),
                guard.pincode.clone(),
                guard.price_per_hour,
            ),
        };

        // Allocate identities for any spots the plan will create. Over- or
        // under-shoot is impossible: the count is exact for a grow and zero
        // otherwise.
        let needed = new_capacity.saturating_sub(guard.spots.len() as u32);
        let fresh_ids: Vec<SpotId> = (0..needed).map(|_| self.alloc_spot_id()).collect();

        let plan = plan_resize(&guard.spots, new_capacity, &fresh_ids)?;

        let fields_changed = name != guard.name
            || address != guard.address
            || pincode != guard.pincode
            || price_per_hour != guard.price_per_hour;
        if plan.is_noop() && !fields_changed {
            return Ok(plan);
        }

        // Claim renamed name/address before committing; unwind on failure.
        let renaming = name != guard.name;
        let readdressing = address != guard.address;
        if renaming {
            match self.names.entry(name.clone()) {
                Entry::Occupied(e) if *e.get() != lot_id => {
                    return Err(EngineError::DuplicateLot {
                        field: "name",
                        value: name,
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(v) => {
                    v.insert(lot_id);
                }
            }
        }
        if readdressing {
            match self.addresses.entry(address.clone()) {
                Entry::Occupied(e) if *e.get() != lot_id => {
                    if renaming {
                        self.names.remove(&name);
                    }
                    return Err(EngineError::DuplicateLot {
                        field: "address",
                        value: address,
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(v) => {
                    v.insert(lot_id);
                }
            }
        }

        let event = Event::LotReconciled {
            lot_id,
            name: name.clone(),
            address: address.clone(),
            pincode,
            price_per_hour,
            plan: plan.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if renaming {
                self.names.remove(&name);
            }
            if readdressing {
                self.addresses.remove(&address);
            }
            return Err(e);
        }

        info!(
            lot = lot_id.0,
            new_capacity,
            created = plan.create.len(),
            deleted = plan.delete.len(),
            renumbered = plan.renumber.len(),
            "lot reconciled"
        );
        Ok(plan)
    }

    /// Delete a lot and cascade its spots and (necessarily closed)
    /// bookings. Refused while any spot is occupied.
    pub async fn delete_lot(&self, lot_id: LotId) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.delete_lot_inner(lot_id).await;
        record_op(
            "delete_lot",
            result.as_ref().map_or_else(|e| e.label(), |_| "ok"),
            started,
        );
        result
    }

    async fn delete_lot_inner(&self, lot_id: LotId) -> Result<(), EngineError> {
        let guard = self.lock_lot_write(lot_id).await?;
        let occupied = guard.occupied_count();
        if occupied > 0 {
            return Err(EngineError::LotHasOccupants { lot_id, occupied });
        }

        let event = Event::LotDeleted { id: lot_id };
        self.wal_append(&event).await?;

        // Remove from the map while still holding the write lock, so any
        // waiter that acquires it afterwards sees the lot gone.
        self.lots.remove(&lot_id);
        self.notify.send(lot_id, &event);
        self.drop_lot_indexes(lot_id, &guard.name, &guard.address, &guard.spots);
        metrics::gauge!(crate::observability::LOTS_ACTIVE).set(self.lots.len() as f64);
        info!(lot = lot_id.0, "lot deleted");
        Ok(())
    }

    /// Reserve the lowest-ordinal available spot in the lot for this user.
    pub async fn reserve(
        &self,
        user_id: UserId,
        lot_id: LotId,
        vehicle: String,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(user_id, lot_id, vehicle).await;
        record_op(
            "reserve",
            result.as_ref().map_or_else(|e| e.label(), |_| "ok"),
            started,
        );
        result
    }

    async fn reserve_inner(
        &self,
        user_id: UserId,
        lot_id: LotId,
        vehicle: String,
    ) -> Result<Booking, EngineError> {
        if vehicle.is_empty() {
            return Err(EngineError::InvalidSpec("vehicle number must not be empty"));
        }
        if vehicle.len() > MAX_VEHICLE_LEN {
            return Err(EngineError::LimitExceeded("vehicle number too long"));
        }
        // Fast pre-check; the authoritative claim happens below.
        if let Some(existing) = self.active_by_user.get(&user_id) {
            return Err(EngineError::AlreadyParked {
                user_id,
                booking_id: *existing.value(),
            });
        }

        let mut guard = self.lock_lot_write(lot_id).await?;
        let spot_id = match guard.first_available() {
            Some(spot) => spot.id,
            None => return Err(EngineError::LotFull(lot_id)),
        };

        let booking_id = self.alloc_booking_id();

        // Claim the one-active-booking-per-user slot. The entry insertion
        // is atomic across lots, so two concurrent reserves by the same
        // user cannot both pass.
        match self.active_by_user.entry(user_id) {
            Entry::Occupied(e) => {
                return Err(EngineError::AlreadyParked {
                    user_id,
                    booking_id: *e.get(),
                });
            }
            Entry::Vacant(v) => {
                v.insert(booking_id);
            }
        }

        let event = Event::BookingOpened {
            id: booking_id,
            user_id,
            lot_id,
            spot_id,
            vehicle,
            start_ms: self.clock.now_ms(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.active_by_user.remove_if(&user_id, |_, b| *b == booking_id);
            return Err(e);
        }
        self.apply_to_lot(&mut guard, &event);
        self.notify.send(lot_id, &event);

        debug!(
            user = user_id.0,
            lot = lot_id.0,
            spot = spot_id.0,
            booking = booking_id.0,
            "spot reserved"
        );
        self.bookings
            .get(&booking_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::BookingNotFound(booking_id))
    }

    /// Close a booking: set end time, charge `round(hours * price, 2)`,
    /// and free the spot. Idempotent — a second call gets AlreadyReleased.
    pub async fn release(
        &self,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.release_inner(booking_id, user_id).await;
        record_op(
            "release",
            result.as_ref().map_or_else(|e| e.label(), |_| "ok"),
            started,
        );
        result
    }

    async fn release_inner(
        &self,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<Booking, EngineError> {
        let lot_id = {
            let booking = self
                .bookings
                .get(&booking_id)
                .ok_or(EngineError::BookingNotFound(booking_id))?;
            if booking.user_id != user_id {
                return Err(EngineError::NotYourBooking(booking_id));
            }
            booking.lot_id
        };

        let mut guard = self.lock_lot_write(lot_id).await?;

        // Re-read under the lot lock: a concurrent release may have won.
        let (start_ms, already_released) = {
            let booking = self
                .bookings
                .get(&booking_id)
                .ok_or(EngineError::BookingNotFound(booking_id))?;
            (booking.start_ms, booking.end_ms.is_some())
        };
        if already_released {
            return Err(EngineError::AlreadyReleased(booking_id));
        }

        // Clamp against clock skew: a booking never ends before it starts
        // and cost is never negative.
        let now = self.clock.now_ms();
        let end_ms = now.max(start_ms);
        let duration_hours = (end_ms - start_ms) as f64 / 3_600_000.0;
        let cost = round_cost(duration_hours * guard.price_per_hour);

        let event = Event::BookingClosed {
            id: booking_id,
            lot_id,
            end_ms,
            cost,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        debug!(
            user = user_id.0,
            booking = booking_id.0,
            cost,
            "spot released"
        );
        self.bookings
            .get(&booking_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::BookingNotFound(booking_id))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: one creation per lot (spot identities in
    /// ordinal order), then every booking's open/close pair.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let mut lot_arcs: Vec<super::SharedLotState> =
            self.lots.iter().map(|e| e.value().clone()).collect();
        let mut lots_snapshot = Vec::with_capacity(lot_arcs.len());
        for rs in lot_arcs.drain(..) {
            let guard = rs.read().await;
            lots_snapshot.push(guard.clone());
        }
        lots_snapshot.sort_by_key(|l| l.id);

        for lot in &lots_snapshot {
            let spot_ids: Vec<SpotId> = lot.spots.iter().map(|s| s.id).collect();
            events.push(Event::LotCreated {
                id: lot.id,
                name: lot.name.clone(),
                address: lot.address.clone(),
                pincode: lot.pincode.clone(),
                price_per_hour: lot.price_per_hour,
                capacity: lot.capacity,
                spot_ids,
            });
        }

        let mut bookings: Vec<Booking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        for b in &bookings {
            events.push(Event::BookingOpened {
                id: b.id,
                user_id: b.user_id,
                lot_id: b.lot_id,
                spot_id: b.spot_id,
                vehicle: b.vehicle.clone(),
                start_ms: b.start_ms,
            });
            if let (Some(end_ms), Some(cost)) = (b.end_ms, b.cost) {
                events.push(Event::BookingClosed {
                    id: b.id,
                    lot_id: b.lot_id,
                    end_ms,
                    cost,
                });
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
