pub mod record;
pub mod task_store;
