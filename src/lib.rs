//! Backup orchestration engine: dumps catalogued databases on a cron
//! schedule, replicates each dump to its destinations and prunes old
//! backups by age and count.

pub mod backup;
pub mod config;
pub mod errors;
pub mod models;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod utils;
