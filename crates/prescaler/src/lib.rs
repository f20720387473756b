//! HTTP surface and configuration of the event-prescaler binary

pub mod api;
pub mod config;
