use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_overlap, validate_range};
use super::{Engine, EngineError, WalCommand};

/// Guest contact fields as received from the wire, not yet normalized.
#[derive(Debug, Clone)]
pub struct GuestDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

impl GuestDetails {
    fn normalized(&self) -> Self {
        Self {
            first_name: self.first_name.to_lowercase(),
            last_name: self.last_name.to_lowercase(),
            email: self.email.to_lowercase(),
            phone: self.phone.clone(),
        }
    }
}

impl Engine {
    pub async fn create_room(&self, id: Ulid, name: &str) -> Result<(), EngineError> {
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = Utc::now();
        let room = Room {
            id,
            name: name.to_lowercase(),
            created_at: now,
            updated_at: now,
        };
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        // Two racing creates with the same id can both reach this point;
        // the entry keeps the first and rejects the second. Replay applies
        // the same keep-first rule.
        match self.rooms.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(RoomState::new(room))));
                Ok(())
            }
        }
    }

    pub async fn rename_room(&self, id: Ulid, name: &str) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let event = Event::RoomRenamed {
            id,
            name: name.to_lowercase(),
            at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete an empty room. A room with restrictions (bookings or
    /// maintenance blocks) must be cleared first. The write lock is held
    /// through the append and the map removal; a racing commit either lands
    /// first (making the room non-empty) or re-checks catalog membership
    /// under its own lock and sees the room gone.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        if !guard.restrictions.is_empty() {
            return Err(EngineError::RoomInUse(id));
        }

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        self.rooms.remove(&id);
        drop(guard);
        Ok(())
    }

    /// The atomic booking commit. Re-checks the overlap predicate under the
    /// room's write lock, then appends one event carrying both the
    /// reservation and its restriction. The lock is held through the WAL
    /// append, so of two racing commits for the same room exactly one
    /// succeeds; the loser observes the winner's restriction and gets
    /// `Conflict`.
    pub async fn commit_booking(
        &self,
        reservation_id: Ulid,
        restriction_id: Ulid,
        room_id: Ulid,
        stay: StayRange,
        guest: &GuestDetails,
    ) -> Result<(), EngineError> {
        validate_range(&stay)?;
        if guest.first_name.len() > MAX_GUEST_FIELD_LEN
            || guest.last_name.len() > MAX_GUEST_FIELD_LEN
            || guest.email.len() > MAX_GUEST_FIELD_LEN
            || guest.phone.len() > MAX_GUEST_FIELD_LEN
        {
            return Err(EngineError::LimitExceeded("guest field too long"));
        }
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;
        // Re-check under the lock: the room may have been deleted while we
        // waited, and a retried client may resubmit the same reservation id.
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::NotFound(room_id));
        }
        if self.reservations.contains_key(&reservation_id) {
            return Err(EngineError::AlreadyExists(reservation_id));
        }
        if guard.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many restrictions on room"));
        }

        check_no_overlap(&guard, &stay)?;

        let guest = guest.normalized();
        let now = Utc::now();
        let reservation = Reservation {
            id: reservation_id,
            first_name: guest.first_name,
            last_name: guest.last_name,
            email: guest.email,
            phone: guest.phone,
            stay,
            room_id,
            processed: false,
            created_at: now,
            updated_at: now,
        };
        let restriction = Restriction {
            id: restriction_id,
            stay,
            room_id,
            reservation_id: Some(reservation_id),
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCommitted {
            reservation,
            restriction,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Add a standalone maintenance block. Same conflict check as a booking.
    pub async fn add_restriction(
        &self,
        id: Ulid,
        room_id: Ulid,
        stay: StayRange,
    ) -> Result<(), EngineError> {
        validate_range(&stay)?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::NotFound(room_id));
        }
        if guard.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many restrictions on room"));
        }

        check_no_overlap(&guard, &stay)?;

        let now = Utc::now();
        let event = Event::RestrictionAdded {
            restriction: Restriction {
                id,
                stay,
                room_id,
                reservation_id: None,
                created_at: now,
                updated_at: now,
            },
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a maintenance block. Booking-linked restrictions are owned by
    /// their reservation and refuse direct removal.
    pub async fn remove_restriction(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (room_id, mut guard) = self.resolve_restriction_write(&id).await?;
        if let Some(r) = guard.get_restriction(id)
            && r.reservation_id.is_some()
        {
            return Err(EngineError::BookingLinked(id));
        }
        let event = Event::RestrictionRemoved {
            restriction_id: id,
            room_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_id)
    }

    /// Cancel a reservation and its linked restriction in one event. The
    /// room becomes bookable for the freed dates as soon as this returns.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let reservation = self
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let restriction_id = self
            .reservation_to_restriction
            .get(&id)
            .map(|e| *e.value());
        let rs = self
            .get_room(&reservation.room_id)
            .ok_or(EngineError::NotFound(reservation.room_id))?;
        let mut guard = rs.write().await;

        let event = Event::ReservationCancelled {
            reservation_id: id,
            restriction_id,
            room_id: reservation.room_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation.room_id)
    }

    pub async fn update_guest(&self, id: Ulid, guest: &GuestDetails) -> Result<(), EngineError> {
        if guest.first_name.len() > MAX_GUEST_FIELD_LEN
            || guest.last_name.len() > MAX_GUEST_FIELD_LEN
            || guest.email.len() > MAX_GUEST_FIELD_LEN
            || guest.phone.len() > MAX_GUEST_FIELD_LEN
        {
            return Err(EngineError::LimitExceeded("guest field too long"));
        }
        let room_id = self
            .reservations
            .get(&id)
            .map(|r| r.room_id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;

        let guest = guest.normalized();
        let event = Event::GuestUpdated {
            reservation_id: id,
            room_id,
            first_name: guest.first_name,
            last_name: guest.last_name,
            email: guest.email,
            phone: guest.phone,
            at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn set_processed(&self, id: Ulid, processed: bool) -> Result<(), EngineError> {
        let room_id = self
            .reservations
            .get(&id)
            .map(|r| r.room_id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;

        let event = Event::ProcessedChanged {
            reservation_id: id,
            room_id,
            processed,
            at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let room_arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in room_arcs {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            for restriction in &guard.restrictions {
                match restriction.reservation_id {
                    Some(res_id) => {
                        // Booking restriction: emit the pair so replay
                        // reconstructs the reservation row too.
                        if let Some(res) = self.reservations.get(&res_id) {
                            events.push(Event::BookingCommitted {
                                reservation: res.value().clone(),
                                restriction: restriction.clone(),
                            });
                        }
                    }
                    None => events.push(Event::RestrictionAdded {
                        restriction: restriction.clone(),
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
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
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
