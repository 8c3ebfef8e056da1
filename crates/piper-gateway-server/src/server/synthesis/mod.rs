pub mod deliver;
pub mod invoker;
pub mod runner;
pub mod workspace;
