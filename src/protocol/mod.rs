//! Session wire protocol
//!
//! JSON text frames exchanged with WebSocket clients once a session is
//! active.

mod messages;

pub use messages::*;
