/// Readiness checks run between staged service starts.
///
/// There is no readiness protocol for the managed daemons, so the default
/// check is a flat warm-up delay. Anything that can tell when a service is
/// actually serving can implement [`Readiness`] and be handed to the
/// supervisor instead.
use crate::service::ServiceKind;
use std::future::Future;
use std::time::Duration;

pub trait Readiness: Send + Sync + 'static {
    /// Resolves once services depending on `kind` may be started.
    fn wait_ready(&self, kind: ServiceKind) -> impl Future<Output = ()> + Send;
}

/// Waits a fixed interval, whatever the service.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Readiness for FixedDelay {
    fn wait_ready(&self, kind: ServiceKind) -> impl Future<Output = ()> + Send {
        tracing::debug!(service = %kind, delay_ms = self.delay.as_millis() as u64, "warming up");
        tokio::time::sleep(self.delay)
    }
}
