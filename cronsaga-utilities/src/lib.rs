pub mod component;
pub mod logger;
pub mod startup;

pub use component::ComponentLogger;
