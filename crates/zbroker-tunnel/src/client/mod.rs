//! Tunnel client components

pub mod agent;

pub use agent::*;
