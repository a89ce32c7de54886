//! WebSocket connection tracking.
//!
//! Every connection belongs to one workspace and receives the updates other
//! clients push to it.

mod manager;

pub use manager::ConnectionManager;
