//! Database and domain models.
//! Each model lives in its own file and is re-exported here so callers can
//! `use crate::db::models::*;`.

pub mod delivery_record;
pub mod delivery_status_log;
pub mod notification_event;
pub mod preferences;

pub use self::delivery_record::*;
pub use self::delivery_status_log::*;
pub use self::notification_event::*;
pub use self::preferences::*;
