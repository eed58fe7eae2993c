pub mod registrar;
pub mod types;
