pub mod api;
pub mod checker;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod report;
pub mod store;
pub mod telemetry;
