use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The stay overlaps an existing restriction (its id is carried).
    Conflict(Ulid),
    /// The room still has restrictions and cannot be deleted.
    RoomInUse(Ulid),
    /// The restriction belongs to a reservation; cancel the reservation instead.
    BookingLinked(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with restriction: {id}"),
            EngineError::RoomInUse(id) => {
                write!(f, "cannot delete room {id}: has restrictions")
            }
            EngineError::BookingLinked(id) => {
                write!(f, "restriction {id} is linked to a reservation")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
