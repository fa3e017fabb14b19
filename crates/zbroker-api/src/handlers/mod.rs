//! HTTP handlers

pub mod broker;
pub mod health;
pub mod response_data;
pub mod status;
