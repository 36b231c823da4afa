//! Infrastructure layer: job stores, dispatcher, configuration, Redis transports.

pub mod config;
pub mod event_bus;
pub mod jobs;
