pub mod activity;
pub mod approval;
pub mod budget;
pub mod clock;
pub mod config;
pub mod contract;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod memory;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod terminal;
pub mod workers;

#[cfg(test)]
pub mod testing;
