// Scheduling core shared by the admin console API

pub mod config;
pub mod connection;
pub mod errors;
pub mod models;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod trigger;
