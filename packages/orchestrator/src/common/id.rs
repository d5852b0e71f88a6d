//! Identifier helpers.

use uuid::Uuid;

/// Time-ordered id for new rows. v7 keeps hot-table indexes append-mostly.
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}
