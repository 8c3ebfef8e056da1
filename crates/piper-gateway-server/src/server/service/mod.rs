pub mod handler;
pub mod orchestrator;
