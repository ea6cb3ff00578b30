pub mod coordinator;
pub mod definition;
mod errors;
pub mod outcome_handler;

pub use coordinator::{CoordinatorSettings, SagaCoordinator, SweepReport};
pub use definition::SagaDefinition;
pub use errors::SagaError;
pub use outcome_handler::SagaOutcomeHandler;
