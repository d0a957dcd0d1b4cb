pub mod checks;
pub mod client;
pub mod clock;
pub mod collector;
pub mod config;
pub mod config_validation;
pub mod errors;
pub mod metrics;
pub mod percentiles;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod stages;
pub mod summary;
pub mod tags;
pub mod thresholds;
pub mod utils;
pub mod worker;
