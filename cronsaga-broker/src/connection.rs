use std::{sync::Arc, time::Duration};

use cronsaga_utilities::ComponentLogger;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time,
};

use crate::Broker;

/// Availability of the broker as last observed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts ran out; the monitor has stopped and signalled shutdown.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(2),
            max_reconnect_attempts: 30,
        }
    }
}

/// Read side of the monitor, shared by publishers.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    pub fn new(status: watch::Receiver<ConnectionStatus>) -> Self {
        Self { status }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_available(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }
}

pub struct ConnectionMonitor;

impl ConnectionMonitor {
    /// Handle that always reports the broker as reachable, for in-process
    /// brokers that cannot disconnect.
    pub fn always_connected() -> ConnectionHandle {
        let (_, rx) = watch::channel(ConnectionStatus::Connected);
        ConnectionHandle::new(rx)
    }

    /// Heartbeat the broker until shutdown. A failed heartbeat moves the
    /// status to `Reconnecting`; after `max_reconnect_attempts` consecutive
    /// failures the status becomes `Exhausted`, `shutdown` is notified so the
    /// rest of the process drains, and the task ends.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        settings: ConnectionSettings,
        logger: ComponentLogger,
        shutdown: Arc<Notify>,
    ) -> (ConnectionHandle, JoinHandle<ConnectionStatus>) {
        let (tx, rx) = watch::channel(ConnectionStatus::Connected);
        let handle = tokio::spawn(async move {
            let stopped = shutdown.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();

            let mut failures: u32 = 0;
            loop {
                let healthy = matches!(
                    time::timeout(settings.heartbeat_timeout, broker.heartbeat()).await,
                    Ok(Ok(()))
                );

                let status = if healthy {
                    if failures > 0 {
                        logger.info(
                            None,
                            format_args!("Broker connection restored after {} attempt(s)", failures),
                        );
                    }
                    failures = 0;
                    ConnectionStatus::Connected
                } else {
                    failures += 1;
                    if failures > settings.max_reconnect_attempts {
                        logger.error(
                            None,
                            format_args!(
                                "Broker unreachable after {} reconnect attempt(s); giving up",
                                settings.max_reconnect_attempts
                            ),
                        );
                        tx.send_replace(ConnectionStatus::Exhausted);
                        shutdown.notify_waiters();
                        return ConnectionStatus::Exhausted;
                    }
                    logger.warn(
                        None,
                        format_args!(
                            "Broker heartbeat failed; reconnect attempt {}/{}",
                            failures, settings.max_reconnect_attempts
                        ),
                    );
                    ConnectionStatus::Reconnecting { attempt: failures }
                };
                tx.send_replace(status);

                let wait = if failures == 0 {
                    settings.heartbeat_interval
                } else {
                    settings.reconnect_interval
                };

                tokio::select! {
                    _ = &mut stopped => {
                        logger.info(None, format_args!("Connection monitor stopped"));
                        return *tx.borrow();
                    }
                    _ = time::sleep(wait) => {}
                }
            }
        });

        (ConnectionHandle::new(rx), handle)
    }
}
