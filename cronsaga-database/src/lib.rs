pub mod errors;
pub mod in_memory;
pub mod interfaces;
mod mappers;
pub mod sqlite;

pub use errors::StoreError;
pub use interfaces::{SagaStore, TaskStore};
