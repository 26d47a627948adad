use chrono::Datelike;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_range(stay: &StayRange) -> Result<(), EngineError> {
    use crate::limits::*;
    if stay.start.year() < MIN_STAY_YEAR || stay.end.year() > MAX_STAY_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_window(window: &StayRange) -> Result<(), EngineError> {
    use crate::limits::*;
    if window.start.year() < MIN_STAY_YEAR || window.end.year() > MAX_STAY_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if window.nights() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// The commit-time conflict check: any restriction overlapping the stay under
/// the strict half-open predicate blocks it. The caller holds the room's
/// write lock, so a pass here stays valid through the subsequent append.
pub(crate) fn check_no_overlap(rs: &RoomState, stay: &StayRange) -> Result<(), EngineError> {
    if let Some(blocking) = rs.overlapping(stay).next() {
        return Err(EngineError::Conflict(blocking.id));
    }
    Ok(())
}
