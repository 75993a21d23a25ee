//! [`Supervisor`] – connection lifecycle and failure recovery.
//!
//! ```text
//!            ┌──────── DeviceNotReady: sleep backoff ───────┐
//!            ▼                                              │
//!   ──▶  INIT ──(bridge + link + channels ok)──▶ RUNNING    RETRYING
//!            │                                      │       ▲
//!            ├──────── DeviceNotReady ──────────────┼───────┘
//!            │                                      │
//!            └── any other error ──▶ TERMINATED ◀───┘ (poll loop stopped)
//! ```
//!
//! * INIT connects the bridge (on a blocking thread, serial I/O blocks), then
//!   the publish link, then attaches every configured sensor.
//! * Only [`SonarError::DeviceNotReady`] leads to RETRYING, and it does so
//!   forever.  Anything else tears down what INIT already opened and
//!   terminates with the error.
//! * When the poll loop stops the link is disconnected and the bridge shut
//!   down before TERMINATED.
//! * An interrupt is honoured in every state and always ends in an orderly
//!   TERMINATED.
//!
//! Every attempt is traced with its attempt number under a span carrying the
//! supervisor's run id.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sonarlink_hal::{BridgeConnection, BridgeConnector, SensorRegistry};
use sonarlink_middleware::{LinkConnector, PublishLink};
use sonarlink_types::{MonitorConfig, SonarError};
use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::poll_loop::{LoopReport, PollLoop};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Running,
    Retrying,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Init => "init",
            SupervisorState::Running => "running",
            SupervisorState::Retrying => "retrying",
            SupervisorState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a supervisor run ended, when it ended without a fatal INIT error.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    /// Initialisation attempts made, including the successful one.
    pub attempts: u32,
    /// `None` when interrupted before the poll loop ever ran.
    pub report: Option<LoopReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    /// `true` when the run ended on an operator interrupt.
    pub fn interrupted(&self) -> bool {
        self.report
            .as_ref()
            .is_none_or(|report| report.reason.is_interrupt())
    }

    /// The link failure that stopped the poll loop, if any.
    pub fn fatal_error(&self) -> Option<&SonarError> {
        self.report.as_ref().and_then(|report| report.reason.error())
    }
}

// Everything one successful INIT produced.
struct Session {
    poll: PollLoop,
    bridge: Arc<dyn BridgeConnection>,
    link: Arc<dyn PublishLink>,
}

pub struct Supervisor {
    config: MonitorConfig,
    bridges: Arc<dyn BridgeConnector>,
    links: Arc<dyn LinkConnector>,
    state: watch::Sender<SupervisorState>,
    run_id: Uuid,
}

impl Supervisor {
    pub fn new(
        config: MonitorConfig,
        bridges: Arc<dyn BridgeConnector>,
        links: Arc<dyn LinkConnector>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Init);
        Self {
            config,
            bridges,
            links,
            state,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Observe state transitions, e.g. to wait for RUNNING.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Run until interrupted, until the poll loop stops on a link failure, or
    /// until INIT fails fatally.
    ///
    /// # Errors
    ///
    /// The first non-recoverable INIT error (configuration, bridge, broker).
    /// Link failures after RUNNING are reported in the
    /// [`RunOutcome`] instead.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<RunOutcome, SonarError> {
        let span = info_span!("supervisor", run_id = %self.run_id);
        self.supervise(shutdown).instrument(span).await
    }

    async fn supervise(self, mut shutdown: ShutdownSignal) -> Result<RunOutcome, SonarError> {
        let started_at = Utc::now();
        let mut attempts: u32 = 0;
        let finish = |attempts, report| RunOutcome {
            run_id: self.run_id,
            attempts,
            report,
            started_at,
            finished_at: Utc::now(),
        };

        if let Err(e) = self.config.validate() {
            error!(error = %e, "configuration rejected");
            self.transition(SupervisorState::Terminated);
            return Err(e);
        }

        loop {
            if shutdown.is_triggered() {
                self.transition(SupervisorState::Terminated);
                return Ok(finish(attempts, None));
            }

            attempts += 1;
            self.transition(SupervisorState::Init);
            info!(attempt = attempts, "initialising");

            match self.initialise(&mut shutdown).await {
                Ok(None) => {
                    info!(attempt = attempts, "interrupted during initialisation");
                    self.transition(SupervisorState::Terminated);
                    return Ok(finish(attempts, None));
                }
                Ok(Some(session)) => {
                    self.transition(SupervisorState::Running);
                    let report = session.poll.run(shutdown.clone()).await;
                    teardown(&session.bridge, &session.link).await;
                    self.transition(SupervisorState::Terminated);
                    return Ok(finish(attempts, Some(report)));
                }
                Err(e) if e.is_recoverable() => {
                    let backoff = self.config.retry_backoff();
                    warn!(
                        attempt = attempts,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "device not ready; retrying"
                    );
                    self.transition(SupervisorState::Retrying);
                    tokio::select! {
                        _ = shutdown.triggered() => {
                            self.transition(SupervisorState::Terminated);
                            return Ok(finish(attempts, None));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    error!(attempt = attempts, error = %e, "initialisation failed");
                    self.transition(SupervisorState::Terminated);
                    return Err(e);
                }
            }
        }
    }

    // `Ok(None)` means the interrupt fired mid-way; whatever was opened has
    // been released.
    async fn initialise(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<Session>, SonarError> {
        let connector = Arc::clone(&self.bridges);
        let connect = tokio::task::spawn_blocking(move || connector.connect());

        // An abandoned blocking connect finishes on its own thread and its
        // result is dropped there.
        let bridge = tokio::select! {
            _ = shutdown.triggered() => return Ok(None),
            joined = connect => joined.map_err(|e| {
                SonarError::BridgeConnection(format!("bridge connect task failed: {e}"))
            })??,
        };

        let link = tokio::select! {
            _ = shutdown.triggered() => {
                shutdown_bridge(&bridge);
                return Ok(None);
            }
            connected = self.links.connect(&self.config.broker) => match connected {
                Ok(link) => link,
                Err(e) => {
                    shutdown_bridge(&bridge);
                    return Err(e);
                }
            },
        };

        let registry = SensorRegistry::attach_all(
            Arc::clone(&bridge),
            &self.config.sensors,
            &self.config.base_topic,
        );
        let poll = PollLoop::new(
            registry,
            Arc::clone(&bridge),
            Arc::clone(&link),
            self.config.poll_interval(),
        );
        Ok(Some(Session { poll, bridge, link }))
    }

    fn transition(&self, next: SupervisorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "supervisor state");
        }
    }
}

async fn teardown(bridge: &Arc<dyn BridgeConnection>, link: &Arc<dyn PublishLink>) {
    link.disconnect().await;
    shutdown_bridge(bridge);
}

fn shutdown_bridge(bridge: &Arc<dyn BridgeConnection>) {
    if let Err(e) = bridge.shutdown() {
        warn!(error = %e, "bridge shutdown failed");
    }
}
