//! Readiness board: the single owner of every service's state.
//!
//! Each service has a `watch` channel; dependents subscribe and wait until
//! the state either satisfies their condition or can never satisfy it.
//! Every transition is also appended to an ordered event log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};

use crate::compose::DependencyCondition;
use crate::metrics::MetricsCollector;

/// Readiness state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Waiting for dependencies.
    Pending,
    /// Started, probe has not passed yet.
    Starting,
    /// Started; no probe, or a one-shot job in progress.
    Running,
    /// Probe succeeded.
    Healthy,
    /// Probe failed `retries` times in a row.
    Unhealthy,
    /// One-shot job exited 0.
    Completed,
    /// Could not be started, exited non-zero, or a dependency failed.
    Failed,
}

impl ServiceState {
    /// Numeric code used for the state gauge.
    pub fn code(&self) -> i64 {
        match self {
            ServiceState::Pending => 0,
            ServiceState::Starting => 1,
            ServiceState::Running => 2,
            ServiceState::Healthy => 3,
            ServiceState::Unhealthy => 4,
            ServiceState::Completed => 5,
            ServiceState::Failed => 6,
        }
    }

    /// Returns true if the service will not change state without a restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceState::Unhealthy | ServiceState::Completed | ServiceState::Failed
        )
    }

    /// Evaluates a dependency condition against this state.
    pub fn satisfies(&self, condition: DependencyCondition) -> Satisfaction {
        use DependencyCondition::*;
        use ServiceState::*;

        match (condition, self) {
            (_, Unhealthy | Failed) => Satisfaction::Never,
            (ServiceStarted, Starting | Running | Healthy | Completed) => Satisfaction::Satisfied,
            (ServiceHealthy, Healthy) => Satisfaction::Satisfied,
            (ServiceHealthy, Completed) => Satisfaction::Never,
            (ServiceCompletedSuccessfully, Completed) => Satisfaction::Satisfied,
            _ => Satisfaction::Waiting,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Unhealthy => write!(f, "unhealthy"),
            ServiceState::Completed => write!(f, "completed"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// Result of checking a condition against a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfaction {
    Satisfied,
    Waiting,
    Never,
}

/// Why waiting on a dependency ended without the condition being met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The dependency reached a state that can never satisfy the condition.
    Unsatisfiable(ServiceState),
    /// The shutdown signal fired.
    Cancelled,
}

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        from: ServiceState,
        to: ServiceState,
    },
    ProbeFailed {
        attempt: u32,
        consecutive: u32,
        reason: String,
    },
    JobAttempt {
        attempt: u32,
    },
    JobExited {
        attempt: u32,
        exit_code: i64,
    },
    DependencyFailed {
        dependency: String,
        state: ServiceState,
    },
    Restarted {
        attempt: u32,
    },
    Stopped,
}

/// Entry in the ordered event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceEvent {
    /// Position in the log, starting at 0.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub service: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Shared board of service states.
pub struct ReadinessBoard {
    states: BTreeMap<String, watch::Sender<ServiceState>>,
    events: Mutex<Vec<SequenceEvent>>,
    next_seq: AtomicU64,
    metrics: MetricsCollector,
}

impl ReadinessBoard {
    /// Creates a board with every service `Pending`.
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states = services
            .into_iter()
            .map(|name| {
                let (tx, _) = watch::channel(ServiceState::Pending);
                (name.into(), tx)
            })
            .collect();

        Self {
            states,
            events: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// Current state of a service, `None` if unknown.
    pub fn state(&self, service: &str) -> Option<ServiceState> {
        self.states.get(service).map(|tx| *tx.borrow())
    }

    /// Snapshot of every state.
    pub fn snapshot(&self) -> BTreeMap<String, ServiceState> {
        self.states
            .iter()
            .map(|(name, tx)| (name.clone(), *tx.borrow()))
            .collect()
    }

    /// Publishes a new state. Unknown services and no-op transitions are ignored.
    ///
    /// The transition is logged before any waiter can observe it, so a
    /// dependent's own transitions always come later in the log.
    pub fn set(&self, service: &str, state: ServiceState) {
        let Some(tx) = self.states.get(service) else {
            return;
        };

        let previous = {
            let mut events = self.lock_events();
            let previous = tx.send_replace(state);
            if previous != state {
                self.push(
                    &mut events,
                    service,
                    EventKind::StateChanged {
                        from: previous,
                        to: state,
                    },
                );
            }
            previous
        };

        if previous != state {
            tracing::info!(service = %service, from = %previous, to = %state, "State changed");
            self.metrics.set_service_state(service, state.code());
        }
    }

    /// Appends an event to the log.
    pub fn record(&self, service: &str, kind: EventKind) {
        let mut events = self.lock_events();
        self.push(&mut events, service, kind);
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<SequenceEvent>> {
        match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, events: &mut Vec<SequenceEvent>, service: &str, kind: EventKind) {
        events.push(SequenceEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            service: service.to_string(),
            kind,
        });
    }

    /// Copy of the event log in order.
    pub fn events(&self) -> Vec<SequenceEvent> {
        self.lock_events().clone()
    }

    /// Waits until `dependency` satisfies `condition` or can never satisfy it.
    ///
    /// An unknown dependency is treated as failed.
    pub async fn wait_for(
        &self,
        dependency: &str,
        condition: DependencyCondition,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), WaitError> {
        let Some(tx) = self.states.get(dependency) else {
            return Err(WaitError::Unsatisfiable(ServiceState::Failed));
        };
        let mut rx = tx.subscribe();

        let wait = async {
            rx.wait_for(|state| state.satisfies(condition) != Satisfaction::Waiting)
                .await
                .map(|state| *state)
        };
        let state = tokio::select! {
            result = wait => match result {
                Ok(state) => state,
                Err(_) => return Err(WaitError::Unsatisfiable(ServiceState::Failed)),
            },
            _ = shutdown.recv() => return Err(WaitError::Cancelled),
        };

        match state.satisfies(condition) {
            Satisfaction::Satisfied => Ok(()),
            _ => Err(WaitError::Unsatisfiable(state)),
        }
    }
}
