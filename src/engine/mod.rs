mod error;
mod mutations;
mod queries;
mod reconcile;

pub use error::EngineError;
pub use reconcile::plan_resize;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLotState = Arc<RwLock<LotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the current batch, then handle the
                            // non-append command.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The parking core. Owns every lot's state plus the engine-level indexes;
/// all mutation goes through the WAL before touching memory, so crash
/// recovery replays to the exact committed state.
pub struct Engine {
    pub(super) lots: DashMap<LotId, SharedLotState>,
    /// Every booking ever opened. Closed bookings are immutable history.
    pub(super) bookings: DashMap<BookingId, Booking>,
    /// One active booking per user, across all lots. The map entry is the
    /// atomic claim that enforces the invariant.
    pub(super) active_by_user: DashMap<UserId, BookingId>,
    /// Reverse lookup: spot id → owning lot id.
    pub(super) spot_to_lot: DashMap<SpotId, LotId>,
    /// Uniqueness indexes for lot names and addresses.
    pub(super) names: DashMap<String, LotId>,
    pub(super) addresses: DashMap<String, LotId>,
    next_lot_id: AtomicU64,
    next_spot_id: AtomicU64,
    next_booking_id: AtomicU64,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    /// Open the engine against a WAL file, replaying any existing log.
    /// Uses the system wall clock.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, Arc::new(SystemClock))
    }

    /// Like [`Engine::new`] but with an injected clock, for deterministic
    /// booking durations in tests.
    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lots: DashMap::new(),
            bookings: DashMap::new(),
            active_by_user: DashMap::new(),
            spot_to_lot: DashMap::new(),
            names: DashMap::new(),
            addresses: DashMap::new(),
            next_lot_id: AtomicU64::new(1),
            next_spot_id: AtomicU64::new(1),
            next_booking_id: AtomicU64::new(1),
            wal_tx,
            notify,
            clock,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds (no contention). Never block here: this may run inside
        // an async context.
        for event in &events {
            match event {
                Event::LotCreated {
                    id,
                    name,
                    address,
                    pincode,
                    price_per_hour,
                    capacity,
                    spot_ids,
                } => {
                    engine.install_lot(
                        *id,
                        name.clone(),
                        address.clone(),
                        pincode.clone(),
                        *price_per_hour,
                        *capacity,
                        spot_ids,
                    );
                    engine.observe_id(&engine.next_lot_id, id.0);
                    for sid in spot_ids {
                        engine.observe_id(&engine.next_spot_id, sid.0);
                    }
                }
                Event::LotDeleted { id } => {
                    engine.uninstall_lot(*id);
                }
                Event::LotReconciled { lot_id, plan, .. } => {
                    if let Some(entry) = engine.lots.get(lot_id) {
                        let rs = entry.value().clone();
                        drop(entry);
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        engine.apply_to_lot(&mut guard, event);
                    }
                    for &(sid, _) in &plan.create {
                        engine.observe_id(&engine.next_spot_id, sid.0);
                    }
                }
                Event::BookingOpened { id, lot_id, .. }
                | Event::BookingClosed { id, lot_id, .. } => {
                    if let Some(entry) = engine.lots.get(lot_id) {
                        let rs = entry.value().clone();
                        drop(entry);
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        engine.apply_to_lot(&mut guard, event);
                    }
                    engine.observe_id(&engine.next_booking_id, id.0);
                }
            }
        }

        metrics::gauge!(crate::observability::LOTS_ACTIVE).set(engine.lots.len() as f64);
        metrics::gauge!(crate::observability::BOOKINGS_ACTIVE)
            .set(engine.active_by_user.len() as f64);

        Ok(engine)
    }

    fn observe_id(&self, counter: &AtomicU64, seen: u64) {
        counter.fetch_max(seen + 1, Ordering::Relaxed);
    }

    pub(super) fn alloc_lot_id(&self) -> LotId {
        LotId(self.next_lot_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(super) fn alloc_spot_id(&self) -> SpotId {
        SpotId(self.next_spot_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(super) fn alloc_booking_id(&self) -> BookingId {
        BookingId(self.next_booking_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get_lot(&self, id: &LotId) -> Option<SharedLotState> {
        self.lots.get(id).map(|e| e.value().clone())
    }

    pub fn lot_for_spot(&self, spot_id: &SpotId) -> Option<LotId> {
        self.spot_to_lot.get(spot_id).map(|e| *e.value())
    }

    /// Get the lot and acquire its write lock, re-checking that the lot
    /// still exists afterwards — a concurrent delete may have won the race
    /// between lookup and lock acquisition.
    pub(super) async fn lock_lot_write(
        &self,
        lot_id: LotId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<LotState>, EngineError> {
        let rs = self.get_lot(&lot_id).ok_or(EngineError::LotNotFound(lot_id))?;
        let guard = rs.write_owned().await;
        if !self.lots.contains_key(&lot_id) {
            return Err(EngineError::LotNotFound(lot_id));
        }
        Ok(guard)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        lot: &mut LotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let lot_id = lot.id;
        self.apply_to_lot(lot, event);
        self.notify.send(lot_id, event);
        Ok(())
    }

    /// Build a lot plus its indexes from a creation event. Shared between
    /// the live create path and replay.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn install_lot(
        &self,
        id: LotId,
        name: String,
        address: String,
        pincode: String,
        price_per_hour: f64,
        capacity: u32,
        spot_ids: &[SpotId],
    ) {
        let mut lot = LotState::new(id, name.clone(), address.clone(), pincode, price_per_hour, capacity);
        for (i, &sid) in spot_ids.iter().enumerate() {
            lot.insert_spot(Spot::new(sid, i as u32 + 1));
            self.spot_to_lot.insert(sid, id);
        }
        self.names.insert(name, id);
        self.addresses.insert(address, id);
        self.lots.insert(id, Arc::new(RwLock::new(lot)));
    }

    /// Drop the engine-level indexes for a removed lot and cascade its
    /// bookings. The lot entry itself must already be out of `lots`.
    pub(super) fn drop_lot_indexes(&self, id: LotId, name: &str, address: &str, spots: &[Spot]) {
        self.names.remove(name);
        self.addresses.remove(address);
        for spot in spots {
            self.spot_to_lot.remove(&spot.id);
        }
        self.bookings.retain(|_, b| b.lot_id != id);
        self.notify.remove(&id);
    }

    /// Replay-only removal: nobody else holds the Arc, so try_read cannot
    /// contend.
    fn uninstall_lot(&self, id: LotId) {
        if let Some((_, rs)) = self.lots.remove(&id) {
            let lot = rs.try_read().expect("replay: uncontended read");
            self.drop_lot_indexes(id, &lot.name, &lot.address, &lot.spots);
        }
    }

    /// Apply a committed event to a lot's state and the engine-level
    /// indexes. Caller holds the lot's write lock (or exclusive ownership
    /// during replay). LotCreated/LotDeleted are handled at the map level,
    /// not here.
    pub(super) fn apply_to_lot(&self, lot: &mut LotState, event: &Event) {
        match event {
            Event::LotReconciled {
                name,
                address,
                pincode,
                price_per_hour,
                plan,
                ..
            } => {
                if *name != lot.name {
                    self.names.remove(&lot.name);
                    self.names.insert(name.clone(), lot.id);
                    lot.name = name.clone();
                }
                if *address != lot.address {
                    self.addresses.remove(&lot.address);
                    self.addresses.insert(address.clone(), lot.id);
                    lot.address = address.clone();
                }
                lot.pincode = pincode.clone();
                lot.price_per_hour = *price_per_hour;

                let doomed: HashSet<SpotId> = plan.delete.iter().copied().collect();
                lot.spots.retain(|s| !doomed.contains(&s.id));
                for sid in &plan.delete {
                    self.spot_to_lot.remove(sid);
                }
                for &(sid, ordinal) in &plan.renumber {
                    if let Some(spot) = lot.spot_mut(sid) {
                        spot.ordinal = ordinal;
                    }
                }
                for &(sid, ordinal) in &plan.create {
                    lot.spots.push(Spot::new(sid, ordinal));
                    self.spot_to_lot.insert(sid, lot.id);
                }
                lot.capacity = plan.new_capacity;
                lot.spots.sort_by_key(|s| s.ordinal);
            }
            Event::BookingOpened {
                id,
                user_id,
                spot_id,
                vehicle,
                start_ms,
                ..
            } => {
                if let Some(spot) = lot.spot_mut(*spot_id) {
                    spot.state = SpotState::Occupied {
                        user_id: *user_id,
                        booking_id: *id,
                    };
                }
                self.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        user_id: *user_id,
                        lot_id: lot.id,
                        spot_id: *spot_id,
                        vehicle: vehicle.clone(),
                        start_ms: *start_ms,
                        end_ms: None,
                        cost: None,
                    },
                );
                self.active_by_user.insert(*user_id, *id);
                metrics::gauge!(crate::observability::BOOKINGS_ACTIVE)
                    .set(self.active_by_user.len() as f64);
            }
            Event::BookingClosed {
                id, end_ms, cost, ..
            } => {
                let mut closed: Option<(UserId, SpotId)> = None;
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.end_ms = Some(*end_ms);
                    booking.cost = Some(*cost);
                    closed = Some((booking.user_id, booking.spot_id));
                }
                if let Some((user_id, spot_id)) = closed {
                    self.active_by_user.remove_if(&user_id, |_, b| b == id);
                    if let Some(spot) = lot.spot_mut(spot_id) {
                        spot.state = SpotState::Available;
                    }
                }
                metrics::gauge!(crate::observability::BOOKINGS_ACTIVE)
                    .set(self.active_by_user.len() as f64);
            }
            Event::LotCreated { .. } | Event::LotDeleted { .. } => {}
        }
    }
}
