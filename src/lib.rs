pub mod auth;
pub mod booking;
pub mod compactor;
pub mod engine;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod validate;
pub mod wal;
pub mod wire;
