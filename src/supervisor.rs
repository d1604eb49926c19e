/// Supervision of a local session: start services in dependency order, give
/// each one a watcher, and stop everything as soon as any one of them exits.
///
/// Every watcher races its own process against the shared [`CancelToken`].
/// The first watcher to see its process exit fires the token; every other
/// watcher then kills its process. Startup is sequential, shutdown is
/// concurrent and unordered.
use crate::process::{ProcessError, ProcessHandle};
use crate::readiness::{FixedDelay, Readiness};
use crate::service::{ServiceDescriptor, ServiceKind};
use crate::token::CancelToken;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// How a watcher's process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// The process exited before the group was stopped.
    Exited,
    /// The group was stopped and the watcher killed its process.
    Terminated,
}

/// What a single watcher observed.
#[derive(Debug)]
pub struct WatchReport {
    pub kind: ServiceKind,
    pub pid: Option<u32>,
    pub started_at: Instant,
    /// When the watcher saw the process gone (after reaping it).
    pub ended_at: Instant,
    pub ending: Ending,
    pub outcome: Result<ExitStatus, ProcessError>,
}

/// Reports from every watcher of a finished session, in dependency order.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub reports: Vec<WatchReport>,
}

#[cfg(test)]
impl SessionReport {
    pub fn get(&self, kind: ServiceKind) -> Option<&WatchReport> {
        self.reports.iter().find(|r| r.kind == kind)
    }
}

pub struct Supervisor<R = FixedDelay> {
    descriptors: Vec<ServiceDescriptor>,
    readiness: R,
    token: CancelToken,
    shutdown_timeout: Duration,
}

impl Supervisor<FixedDelay> {
    /// Supervisor pausing a flat `warmup` after each service others depend on.
    pub fn new(descriptors: Vec<ServiceDescriptor>, warmup: Duration, token: CancelToken) -> Self {
        Self::with_readiness(descriptors, FixedDelay::new(warmup), token)
    }
}

impl<R: Readiness> Supervisor<R> {
    pub fn with_readiness(descriptors: Vec<ServiceDescriptor>, readiness: R, token: CancelToken) -> Self {
        Self {
            descriptors,
            readiness,
            token,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Bound on how long stopping waits for watchers to reap their processes.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Start every service and return the running group without waiting.
    ///
    /// Services start in dependency order. After a service that others
    /// depend on, the readiness check runs before the next start. Once the
    /// token fires, during a pause or because a spawn failed, nothing further
    /// is started.
    pub async fn start(self) -> RunningGroup {
        let Supervisor {
            mut descriptors,
            readiness,
            token,
            shutdown_timeout,
        } = self;

        descriptors.sort_by_key(ServiceDescriptor::kind);
        let total = descriptors.len();
        let mut group = JoinSet::new();

        for (i, descriptor) in descriptors.into_iter().enumerate() {
            let kind = descriptor.kind();
            if token.is_triggered() {
                tracing::info!(service = %kind, "session stopping, not starting service");
                break;
            }

            match ProcessHandle::start(descriptor) {
                Ok(handle) => {
                    group.spawn(watch(handle, token.clone()));
                }
                Err(e) => {
                    tracing::error!(service = %kind, error = %e, "failed to run service");
                    token.trigger(&format!("{kind} failed to start"));
                    break;
                }
            }

            if kind.has_dependents() && i + 1 < total {
                tokio::select! {
                    _ = readiness.wait_ready(kind) => {}
                    _ = token.cancelled() => {}
                }
            }
        }

        RunningGroup {
            group,
            token,
            shutdown_timeout,
        }
    }

    /// Start every service, then block until the session is over.
    pub async fn run(self) -> SessionReport {
        self.start().await.wait().await
    }
}

/// The watchers of a started session.
pub struct RunningGroup {
    group: JoinSet<WatchReport>,
    token: CancelToken,
    shutdown_timeout: Duration,
}

impl RunningGroup {
    /// Number of services that were started.
    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    /// Block until the token fires, then collect every watcher.
    ///
    /// Watchers still running after the shutdown timeout are aborted; their
    /// children are killed when dropped.
    pub async fn wait(self) -> SessionReport {
        let RunningGroup {
            mut group,
            token,
            shutdown_timeout,
        } = self;

        token.cancelled().await;

        let mut reports = Vec::with_capacity(group.len());
        let deadline = tokio::time::sleep(shutdown_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = group.join_next() => match joined {
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(e)) => tracing::warn!(error = %e, "watcher task failed"),
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        remaining = group.len(),
                        "watchers did not finish before shutdown timeout, aborting"
                    );
                    group.abort_all();
                    break;
                }
            }
        }

        reports.sort_by_key(|r| r.kind);
        tracing::info!(services = reports.len(), "development session ended");
        SessionReport { reports }
    }
}

/// Watch one process until it exits or the group is stopped.
async fn watch(mut handle: ProcessHandle, token: CancelToken) -> WatchReport {
    let kind = handle.kind();

    let exited = tokio::select! {
        outcome = handle.wait() => Some(outcome),
        _ = token.cancelled() => None,
    };

    let (ending, outcome) = match exited {
        Some(outcome) => {
            handle.kill_leftovers();
            log_outcome(kind, &outcome);
            token.trigger(&format!("{kind} exited"));
            (Ending::Exited, outcome)
        }
        None => {
            tracing::debug!(service = %kind, "session stopping, terminating service");
            handle.terminate();
            let outcome = handle.wait().await;
            match &outcome {
                Ok(status) => tracing::info!(service = %kind, %status, "service terminated"),
                Err(e) => tracing::warn!(service = %kind, error = %e, "failed to reap terminated service"),
            }
            (Ending::Terminated, outcome)
        }
    };

    WatchReport {
        kind,
        pid: handle.pid(),
        started_at: handle.started_at(),
        ended_at: Instant::now(),
        ending,
        outcome,
    }
}

fn log_outcome(kind: ServiceKind, outcome: &Result<ExitStatus, ProcessError>) {
    match outcome {
        Ok(status) if status.success() => {
            tracing::info!(service = %kind, "service exited normally")
        }
        Ok(status) => tracing::warn!(service = %kind, %status, "service exited with failure"),
        Err(e) => tracing::error!(service = %kind, error = %e, "service failed"),
    }
}

#[cfg(test)]
impl<R: Readiness> Supervisor<R> {
    fn token(&self) -> &CancelToken {
        &self.token
    }
}
