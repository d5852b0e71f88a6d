pub mod error;
pub mod id;

pub use error::{Error, Kind, Result};
pub use id::db_id;
