pub mod core;
pub mod errors;
pub mod saga;
