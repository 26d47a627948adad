use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_window;
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    /// True iff no restriction for the room overlaps the stay under the
    /// strict half-open predicate. A stay starting the day another ends is
    /// available.
    pub async fn is_available(&self, room_id: Ulid, stay: StayRange) -> Result<bool, EngineError> {
        validate_window(&stay)?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.overlapping(&stay).next().is_none())
    }

    /// Every room with no restriction overlapping the stay, ordered by name.
    /// The set complement of the per-room check across the whole catalog.
    pub async fn find_available_rooms(&self, stay: StayRange) -> Result<Vec<RoomInfo>, EngineError> {
        validate_window(&stay)?;

        // Snapshot the Arcs first so no DashMap shard guard is held across
        // an await.
        let snapshot: Vec<SharedRoomState> =
            self.rooms.iter().map(|e| e.value().clone()).collect();

        let mut available = Vec::new();
        for rs in snapshot {
            let guard = rs.read().await;
            if guard.overlapping(&stay).next().is_none() {
                available.push(RoomInfo::from(&guard.room));
            }
        }
        available.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(available)
    }
}
