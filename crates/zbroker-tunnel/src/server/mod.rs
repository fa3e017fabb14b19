//! Tunnel server components
//!
//! The [`ConnectionRegistry`] tracks identified tunnel endpoints per token and
//! the [`ControlHandler`] runs the WebSocket side of each connection.

pub mod control;
pub mod registry;

pub use control::*;
pub use registry::*;
