mod config;
pub mod types;
