//! Broker session management.
//!
//! - `ConnectionManager` - connect with retry policy and capability check
//! - `Session` - shared handle over one broker link, with reconnect supervision
//! - `transport::MemoryBroker` - in-process broker (feature `memory`)

pub mod manager;
pub mod transport;

pub use manager::{ConnectionManager, Session, SessionResource, SessionState};
