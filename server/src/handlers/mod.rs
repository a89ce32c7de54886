//! Request handlers for sync operations.

mod clocks;
mod pull;
mod push;
mod websocket;

pub use clocks::*;
pub use pull::*;
pub use push::*;
pub use websocket::*;

use crate::error::{AppError, Result};

/// Convert a client supplied clock to a row id.
fn clock_to_id(clock: Option<u64>) -> Result<i64> {
    i64::try_from(clock.unwrap_or(0)).map_err(|_| AppError::BadRequest("clock out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_map_to_row_ids() {
        assert_eq!(clock_to_id(None).unwrap(), 0);
        assert_eq!(clock_to_id(Some(42)).unwrap(), 42);
        assert!(clock_to_id(Some(u64::MAX)).is_err());
    }
}
