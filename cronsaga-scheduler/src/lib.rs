pub mod config;
pub mod cron;
pub mod registry;
pub mod scheduler;

pub use cron::{compute_next_run, is_valid_cron_expression, CronCalculator, CronError};
pub use registry::{RegistryError, TaskRegistry};
pub use scheduler::{Scheduler, SchedulerSettings, TaskTransition, TickReport};
