pub mod docker;
pub mod image;
pub mod state;
pub mod types;

#[cfg(test)]
pub mod fake;
