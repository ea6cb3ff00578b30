use std::{fmt, sync::Arc};

use cronsaga_models::core::CorrelationId;
use log::Level;

/// Logger handed to a component at construction time.
///
/// Every record carries the fixed `service` and `component` fields and, when
/// the caller has one, the correlation id of the unit of work being logged.
#[derive(Debug, Clone)]
pub struct ComponentLogger {
    service: Arc<str>,
    component: Arc<str>,
    target: Arc<str>,
}

impl ComponentLogger {
    pub fn new(service: &str, component: &str) -> Self {
        Self {
            service: service.into(),
            component: component.into(),
            target: format!("{service}::{component}").into(),
        }
    }

    /// Same service, different component.
    pub fn child(&self, component: &str) -> Self {
        Self::new(&self.service, component)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn log(&self, level: Level, correlation: Option<&CorrelationId>, args: fmt::Arguments<'_>) {
        let target: &str = &self.target;
        match correlation {
            Some(id) => log::log!(
                target: target,
                level,
                "service={} component={} correlation_id={} {}",
                self.service,
                self.component,
                id,
                args
            ),
            None => log::log!(
                target: target,
                level,
                "service={} component={} {}",
                self.service,
                self.component,
                args
            ),
        }
    }

    pub fn debug(&self, correlation: Option<&CorrelationId>, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, correlation, args);
    }

    pub fn info(&self, correlation: Option<&CorrelationId>, args: fmt::Arguments<'_>) {
        self.log(Level::Info, correlation, args);
    }

    pub fn warn(&self, correlation: Option<&CorrelationId>, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, correlation, args);
    }

    pub fn error(&self, correlation: Option<&CorrelationId>, args: fmt::Arguments<'_>) {
        self.log(Level::Error, correlation, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_joins_service_and_component() {
        let logger = ComponentLogger::new("cronsaga-scheduler", "dispatcher");
        assert_eq!(&*logger.target, "cronsaga-scheduler::dispatcher");

        let child = logger.child("scheduler-loop");
        assert_eq!(child.service(), "cronsaga-scheduler");
        assert_eq!(child.component(), "scheduler-loop");
    }
}
