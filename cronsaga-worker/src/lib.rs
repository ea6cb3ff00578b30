pub mod consumer;
pub mod effect;
pub mod handler;
pub mod idempotency;
pub mod saga_step_handler;
pub mod task_handler;

pub use consumer::{Consumer, ConsumerError, ConsumerSettings, Disposition};
pub use handler::{DeliveryContext, HandlerError, HandlerRegistry, MessageHandler};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
pub use saga_step_handler::SagaStepHandler;
pub use task_handler::HttpTaskHandler;
