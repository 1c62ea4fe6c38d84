pub mod config;
pub mod station;
