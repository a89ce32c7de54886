//! Database module for PostgreSQL persistence.

mod pool;
mod updates;

pub use pool::*;
pub use updates::*;
