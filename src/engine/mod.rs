mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use mutations::GuestDetails;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

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
/// 5. Respond Ok to all senders.
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
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
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

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
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

pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    /// Reservation rows, keyed by id. The room's restriction list is the
    /// availability source of truth; this table serves guest queries.
    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: restriction id → room id
    pub(super) restriction_to_room: DashMap<Ulid, Ulid>,
    /// Reservation id → its booking restriction id
    pub(super) reservation_to_restriction: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a RoomState (no locking — caller holds the lock).
fn apply_to_room(engine: &Engine, rs: &mut RoomState, event: &Event) {
    match event {
        Event::RoomRenamed { name, at, .. } => {
            rs.room.name = name.clone();
            rs.room.updated_at = *at;
        }
        Event::BookingCommitted {
            reservation,
            restriction,
        } => {
            rs.insert_restriction(restriction.clone());
            engine
                .restriction_to_room
                .insert(restriction.id, restriction.room_id);
            engine
                .reservation_to_restriction
                .insert(reservation.id, restriction.id);
            engine.reservations.insert(reservation.id, reservation.clone());
        }
        Event::ReservationCancelled {
            reservation_id,
            restriction_id,
            ..
        } => {
            if let Some(rid) = restriction_id {
                rs.remove_restriction(*rid);
                engine.restriction_to_room.remove(rid);
            }
            engine.reservation_to_restriction.remove(reservation_id);
            engine.reservations.remove(reservation_id);
        }
        Event::GuestUpdated {
            reservation_id,
            first_name,
            last_name,
            email,
            phone,
            at,
            ..
        } => {
            if let Some(mut res) = engine.reservations.get_mut(reservation_id) {
                res.first_name = first_name.clone();
                res.last_name = last_name.clone();
                res.email = email.clone();
                res.phone = phone.clone();
                res.updated_at = *at;
            }
        }
        Event::ProcessedChanged {
            reservation_id,
            processed,
            at,
            ..
        } => {
            if let Some(mut res) = engine.reservations.get_mut(reservation_id) {
                res.processed = *processed;
                res.updated_at = *at;
            }
        }
        Event::RestrictionAdded { restriction } => {
            rs.insert_restriction(restriction.clone());
            engine
                .restriction_to_room
                .insert(restriction.id, restriction.room_id);
        }
        Event::RestrictionRemoved { restriction_id, .. } => {
            rs.remove_restriction(*restriction_id);
            engine.restriction_to_room.remove(restriction_id);
        }
        // RoomCreated/Deleted are handled at the DashMap level, not here
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            reservations: DashMap::new(),
            wal_tx,
            restriction_to_room: DashMap::new(),
            reservation_to_restriction: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this runs inside an async context.
        for event in &events {
            match event {
                Event::RoomCreated { room } => {
                    // Keep the first create for a given id, matching
                    // create_room's duplicate handling.
                    engine
                        .rooms
                        .entry(room.id)
                        .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(room.clone()))));
                }
                Event::RoomDeleted { id } => {
                    engine.rooms.remove(id);
                }
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(entry) = engine.rooms.get(&room_id)
                    {
                        let rs_arc = entry.value().clone();
                        drop(entry);
                        let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                        apply_to_room(&engine, &mut guard, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_restriction(&self, restriction_id: &Ulid) -> Option<Ulid> {
        self.restriction_to_room
            .get(restriction_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply in one call. The WAL is the commit point: the
    /// in-memory state only changes after the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(self, rs, event);
        Ok(())
    }

    /// Lookup restriction → room, get room, acquire write lock.
    pub(super) async fn resolve_restriction_write(
        &self,
        restriction_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_restriction(restriction_id)
            .ok_or(EngineError::NotFound(*restriction_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        Ok((room_id, guard))
    }
}

/// Extract the room_id from an event (for non-Create/Delete events).
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RoomRenamed { id, .. } => Some(*id),
        Event::BookingCommitted { restriction, .. } => Some(restriction.room_id),
        Event::ReservationCancelled { room_id, .. }
        | Event::GuestUpdated { room_id, .. }
        | Event::ProcessedChanged { room_id, .. }
        | Event::RestrictionRemoved { room_id, .. } => Some(*room_id),
        Event::RestrictionAdded { restriction } => Some(restriction.room_id),
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => None,
    }
}
