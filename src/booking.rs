//! The guest booking workflow: search → hold a stay → choose a room →
//! validate the guest form → commit → queue the confirmation mail.

use std::sync::Arc;

use tracing::warn;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, GuestDetails};
use crate::mailer::{Mailer, NotificationJob};
use crate::model::{RoomInfo, StayRange};
use crate::validate::{validate_guest, FieldErrors};

/// A stay a guest is in the middle of booking. Transient: it lives in the
/// caller's session, never in the engine, and vanishes if abandoned.
#[derive(Debug, Clone)]
pub struct HeldBooking {
    pub stay: StayRange,
    pub room_id: Option<Ulid>,
    pub room_name: Option<String>,
}

impl HeldBooking {
    pub fn new(stay: StayRange) -> Self {
        Self {
            stay,
            room_id: None,
            room_name: None,
        }
    }

    pub fn choose_room(&mut self, room: &RoomInfo) {
        self.room_id = Some(room.id);
        self.room_name = Some(room.name.clone());
    }
}

/// Guest contact fields as submitted.
#[derive(Debug, Clone, Default)]
pub struct GuestForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug)]
pub enum BookingError {
    /// Field-level validation failures; nothing was written.
    Input(FieldErrors),
    /// The held booking never had a room chosen.
    NoRoomChosen,
    /// The chosen room was deleted between search and commit.
    RoomVanished(Ulid),
    /// Someone else took the dates between search and commit.
    Conflict,
    Storage(String),
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::Input(errors) => {
                write!(f, "invalid input:")?;
                for (field, message) in errors {
                    write!(f, " {field}: {message};")?;
                }
                Ok(())
            }
            BookingError::NoRoomChosen => write!(f, "no room chosen"),
            BookingError::RoomVanished(id) => write!(f, "room no longer exists: {id}"),
            BookingError::Conflict => write!(f, "room is no longer available for those dates"),
            BookingError::Storage(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

/// What a successful commit hands back.
#[derive(Debug, Clone, Copy)]
pub struct BookingReceipt {
    pub reservation_id: Ulid,
    pub restriction_id: Ulid,
}

/// Front desk for the booking workflow. Owns the engine and the mail
/// dispatcher; the wire layer talks to this, not to the engine directly,
/// for anything booking-shaped.
pub struct BookingDesk {
    engine: Arc<Engine>,
    mailer: Arc<Mailer>,
    from_address: String,
}

impl BookingDesk {
    pub fn new(engine: Arc<Engine>, mailer: Arc<Mailer>, from_address: String) -> Self {
        Self {
            engine,
            mailer,
            from_address,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn mailer(&self) -> &Arc<Mailer> {
        &self.mailer
    }

    /// Search availability and open a held booking for the stay.
    pub async fn search(
        &self,
        stay: StayRange,
    ) -> Result<(Vec<RoomInfo>, HeldBooking), BookingError> {
        let rooms = self
            .engine
            .find_available_rooms(stay)
            .await
            .map_err(engine_to_booking)?;
        Ok((rooms, HeldBooking::new(stay)))
    }

    /// One-shot convenience: hold, choose, and commit in a single call,
    /// with a caller-supplied reservation id. This is what the wire layer's
    /// INSERT INTO bookings uses.
    pub async fn book_room(
        &self,
        reservation_id: Ulid,
        room_id: Ulid,
        stay: StayRange,
        form: &GuestForm,
    ) -> Result<BookingReceipt, BookingError> {
        let room = self
            .engine
            .room_info(room_id)
            .await
            .ok_or(BookingError::RoomVanished(room_id))?;
        let mut held = HeldBooking::new(stay);
        held.choose_room(&room);
        self.commit_as(reservation_id, &held, form).await
    }

    /// Validate and commit a held booking, then queue the confirmation
    /// mail. Returns once the mail job is queued — delivery is tracked
    /// separately and never affects the commit.
    pub async fn commit(
        &self,
        held: &HeldBooking,
        form: &GuestForm,
    ) -> Result<BookingReceipt, BookingError> {
        self.commit_as(Ulid::new(), held, form).await
    }

    async fn commit_as(
        &self,
        reservation_id: Ulid,
        held: &HeldBooking,
        form: &GuestForm,
    ) -> Result<BookingReceipt, BookingError> {
        validate_guest(&form.first_name, &form.last_name, &form.email, &form.phone)
            .map_err(BookingError::Input)?;

        let room_id = held.room_id.ok_or(BookingError::NoRoomChosen)?;
        let receipt = BookingReceipt {
            reservation_id,
            restriction_id: Ulid::new(),
        };
        let guest = GuestDetails {
            first_name: form.first_name.clone(),
            last_name: form.last_name.clone(),
            email: form.email.clone(),
            phone: form.phone.clone(),
        };

        self.engine
            .commit_booking(
                receipt.reservation_id,
                receipt.restriction_id,
                room_id,
                held.stay,
                &guest,
            )
            .await
            .map_err(engine_to_booking)?;

        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);

        let room_name = match held.room_name.clone() {
            Some(name) => name,
            None => self
                .engine
                .room_info(room_id)
                .await
                .map(|r| r.name)
                .unwrap_or_default(),
        };
        self.mailer
            .submit_tracked(
                receipt.reservation_id,
                confirmation_job(&self.from_address, &guest, &room_name, &held.stay),
            )
            .await;

        Ok(receipt)
    }
}

fn engine_to_booking(err: EngineError) -> BookingError {
    match err {
        EngineError::Conflict(_) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            BookingError::Conflict
        }
        EngineError::NotFound(id) => BookingError::RoomVanished(id),
        EngineError::WalError(e) => {
            warn!(error = %e, "booking commit hit a storage failure");
            BookingError::Storage(e)
        }
        other => BookingError::Storage(other.to_string()),
    }
}

fn confirmation_job(
    from: &str,
    guest: &GuestDetails,
    room_name: &str,
    stay: &StayRange,
) -> NotificationJob {
    NotificationJob {
        from: from.to_string(),
        to: guest.email.to_lowercase(),
        subject: "Reservation Confirmation".into(),
        template: "confirmation".into(),
        attachments: Vec::new(),
        payload: serde_json::json!({
            "name": format!("{} {}", guest.first_name.to_lowercase(), guest.last_name.to_lowercase()),
            "room": room_name,
            "start_date": stay.start.to_string(),
            "end_date": stay.end.to_string(),
        }),
    }
}
