//! WebSocket module for venue connection management

mod client;
mod manager;

pub use client::{StreamConnection, TransportConfig};
pub use manager::{Session, StreamManager, StreamSettings};
