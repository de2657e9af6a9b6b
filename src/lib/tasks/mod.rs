pub mod docker;
#[cfg(test)]
pub mod mock;
pub mod state;
pub mod types;
