pub mod config;
pub mod error;
pub mod orchestrator;
pub mod results;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
