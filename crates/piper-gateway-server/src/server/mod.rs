pub mod config;
pub mod routes;
pub mod service;
pub mod synthesis;
pub mod telemetry;
