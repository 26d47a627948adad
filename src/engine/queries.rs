use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_window;
use super::{Engine, EngineError};

impl Engine {
    pub async fn room_info(&self, id: Ulid) -> Option<RoomInfo> {
        let rs = self.get_room(&id)?;
        let guard = rs.read().await;
        Some(RoomInfo::from(&guard.room))
    }

    /// Lookup by name. Names are stored lowercased, so compare lowercased.
    pub async fn find_room_by_name(&self, name: &str) -> Option<RoomInfo> {
        let wanted = name.to_lowercase();
        let snapshot: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in snapshot {
            let guard = rs.read().await;
            if guard.room.name == wanted {
                return Some(RoomInfo::from(&guard.room));
            }
        }
        None
    }

    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let snapshot: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(snapshot.len());
        for rs in snapshot {
            let guard = rs.read().await;
            rooms.push(RoomInfo::from(&guard.room));
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// All reservations with their room names joined in, ordered by stay
    /// start date.
    pub async fn list_reservations(&self) -> Vec<ReservationView> {
        self.reservation_views(|_| true).await
    }

    /// Reservations staff have not yet handled.
    pub async fn new_reservations(&self) -> Vec<ReservationView> {
        self.reservation_views(|r| !r.processed).await
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<ReservationView> {
        let reservation = self.reservations.get(&id).map(|r| r.value().clone())?;
        let room_name = match self.room_info(reservation.room_id).await {
            Some(info) => info.name,
            None => String::new(),
        };
        Some(ReservationView {
            reservation,
            room_name,
        })
    }

    async fn reservation_views(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<ReservationView> {
        let snapshot: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();

        let mut views = Vec::with_capacity(snapshot.len());
        for reservation in snapshot {
            let room_name = match self.room_info(reservation.room_id).await {
                Some(info) => info.name,
                None => String::new(),
            };
            views.push(ReservationView {
                reservation,
                room_name,
            });
        }
        views.sort_by_key(|v| v.reservation.stay.start);
        views
    }

    /// Restrictions for a room overlapping the query window.
    pub async fn restrictions_for_room(
        &self,
        room_id: Ulid,
        window: StayRange,
    ) -> Result<Vec<Restriction>, EngineError> {
        validate_window(&window)?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.overlapping(&window).cloned().collect())
    }
}
