pub mod api;
pub mod config;
pub mod identity;
pub mod provision;
pub mod stats;
pub mod types;
pub mod watcher;
pub mod worker;

#[cfg(test)]
pub mod testing;
