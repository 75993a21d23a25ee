//! [`MqttLink`] – MQTT publish link on top of `rumqttc`.
//!
//! `connect` drives the event loop until the broker's CONNACK arrives (under
//! a timeout), then hands the event loop to a background task that keeps
//! polling it.  `rumqttc` reconnects on the next poll after a network error;
//! the task backs off exponentially between failed polls and gives up after
//! [`MAX_CONSECUTIVE_ERRORS`], at which point the link is marked dead and
//! every later [`publish`][PublishLink::publish] fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::Event::{Incoming, Outgoing};
use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, EventLoop, MqttOptions, Packet, QoS};
use sonarlink_types::{BrokerConfig, SonarError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::link::{LinkConnector, PublishLink};

/// Outgoing request queue between the client handle and the event loop.
const REQUEST_QUEUE_CAPACITY: usize = 64;

pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How long `disconnect` waits for the event loop to flush and exit.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

// Liveness shared with the event-loop task.
#[derive(Debug, Default)]
struct LinkHealth {
    dead: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl LinkHealth {
    fn mark_dead(&self, reason: impl Into<String>) {
        *lock(&self.reason) = Some(reason.into());
        self.dead.store(true, Ordering::Release);
    }

    fn check(&self, broker: &str) -> Result<(), SonarError> {
        if !self.dead.load(Ordering::Acquire) {
            return Ok(());
        }
        let reason = lock(&self.reason)
            .clone()
            .unwrap_or_else(|| "link closed".to_string());
        Err(SonarError::BrokerConnection(format!("{broker}: {reason}")))
    }
}

pub struct MqttLink {
    client: AsyncClient,
    broker: String,
    health: Arc<LinkHealth>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    /// Connect to the broker described by `config` and wait for CONNACK.
    ///
    /// # Errors
    ///
    /// [`SonarError::BrokerConnection`] on a network failure, a refused
    /// CONNECT, or when no CONNACK arrives within
    /// `config.connect_timeout_ms`.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, SonarError> {
        let broker = format!("{}:{}", config.host, config.port);

        let (client, event_loop) = AsyncClient::new(mqtt_options(config), REQUEST_QUEUE_CAPACITY);

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let event_loop = tokio::time::timeout(timeout, establish(event_loop, &broker))
            .await
            .map_err(|_| {
                SonarError::BrokerConnection(format!(
                    "{broker}: no CONNACK within {} ms",
                    config.connect_timeout_ms
                ))
            })??;

        info!(broker = %broker, client_id = %config.client_id, "broker link established");

        let health = Arc::new(LinkHealth::default());
        let task_health = Arc::clone(&health);
        let task_broker = broker.clone();
        let handle = tokio::spawn(async move {
            drive(event_loop, &task_health, &task_broker).await;
        });

        Ok(Self {
            client,
            broker,
            health,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    /// `host:port` this link talks to.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn is_alive(&self) -> bool {
        self.health.check(&self.broker).is_ok()
    }
}

#[async_trait]
impl PublishLink for MqttLink {
    fn publish(&self, topic: &str, payload: String) -> Result<(), SonarError> {
        self.health.check(&self.broker)?;
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.into_bytes())
        {
            // The event loop may have died between the check and the send.
            self.health.check(&self.broker)?;
            warn!(topic, error = %e, "publish queue full; message dropped");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(broker = %self.broker, error = %e, "disconnect request not queued");
        }
        let handle = lock(&self.event_loop).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                warn!(broker = %self.broker, "event loop did not stop in time; aborting");
                handle.abort();
            }
        }
        self.health.mark_dead("disconnected");
        info!(broker = %self.broker, "broker link closed");
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.event_loop).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MqttLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttLink")
            .field("broker", &self.broker)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// [`LinkConnector`] producing [`MqttLink`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

#[async_trait]
impl LinkConnector for MqttConnector {
    async fn connect(&self, broker: &BrokerConfig) -> Result<Arc<dyn PublishLink>, SonarError> {
        let link = MqttLink::connect(broker).await?;
        Ok(Arc::new(link))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event loop
// ────────────────────────────────────────────────────────────────────────────

async fn establish(mut event_loop: EventLoop, broker: &str) -> Result<EventLoop, SonarError> {
    loop {
        match event_loop.poll().await {
            Ok(Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
                if code == ConnectReturnCode::Success {
                    return Ok(event_loop);
                }
                return Err(SonarError::BrokerConnection(format!(
                    "{broker}: connection refused ({code:?})"
                )));
            }
            Ok(notification) => {
                debug!(notification = ?notification, "bootstrap notification");
            }
            Err(e) => {
                return Err(SonarError::BrokerConnection(format!("{broker}: {e}")));
            }
        }
    }
}

async fn drive(mut event_loop: EventLoop, health: &LinkHealth, broker: &str) {
    let mut error_count: u32 = 0;
    loop {
        match event_loop.poll().await {
            Ok(Incoming(Packet::ConnAck(ConnAck {
                code: ConnectReturnCode::Success,
                ..
            }))) => {
                error_count = 0;
                info!(broker, "broker link re-established");
            }
            Ok(Incoming(Packet::Disconnect)) => {
                warn!(broker, "broker closed the session");
                health.mark_dead("broker closed the session");
                break;
            }
            Ok(Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!(broker, "disconnect sent");
                break;
            }
            Ok(_) => {
                error_count = 0;
            }
            Err(e) => {
                error_count += 1;
                error!(broker, error_count, error = %e, "broker event loop error");

                if error_count >= MAX_CONSECUTIVE_ERRORS {
                    error!(broker, error_count, "too many consecutive errors; link is dead");
                    health.mark_dead(format!("{error_count} consecutive errors, last: {e}"));
                    break;
                }

                let delay = retry_delay(error_count);
                warn!(broker, delay = ?delay, "retrying broker connection");
                tokio::time::sleep(delay).await;
            }
        }
    }
    debug!(broker, "broker event loop terminated");
}

/// Backoff before the next poll after `error_count` consecutive failures.
fn retry_delay(error_count: u32) -> Duration {
    let exp = error_count.saturating_sub(1).min(10);
    (INITIAL_RETRY_DELAY * 2_u32.pow(exp)).min(MAX_RETRY_DELAY)
}

// Keep-alive goes through unchanged: rumqttc takes 0 (disabled) or any
// whole number of seconds.
fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(u64::from(config.keepalive_secs)));
    options.set_clean_session(true);
    options
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
