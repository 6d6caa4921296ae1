use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet, Publish, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::ports::{Notification, Notifier};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Every topic the controller touches, derived from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Topics {
    pub(crate) request: String,
    started: String,
    stopped: String,
    flow: String,
    schedule: String,
    rain_delay_ended: String,
    rain_delay_set: String,
}

impl Topics {
    pub(crate) fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let t = |suffix: &str| format!("{prefix}/{suffix}");
        Self {
            request: t("request"),
            started: t("started"),
            stopped: t("stopped"),
            flow: t("flow"),
            schedule: t("schedule"),
            rain_delay_ended: t("rain-delay/ended"),
            rain_delay_set: t("rain-delay/set"),
        }
    }

    pub(crate) fn is_command(&self, topic: &str) -> bool {
        topic == self.request
    }

    /// Topic and payload for an outbound notification.
    pub(crate) fn route(&self, note: &Notification) -> (&str, String) {
        match note {
            Notification::DripStarted => (&self.started, String::new()),
            Notification::DripStopped => (&self.stopped, String::new()),
            Notification::FlowReport(liters) => (&self.flow, liters.to_string()),
            Notification::ScheduleLine(line) => (&self.schedule, line.clone()),
            Notification::RainDelayEnded => (&self.rain_delay_ended, String::new()),
            Notification::RainDelaySet { hours } => (&self.rain_delay_set, hours.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Publishes through the client's request queue without awaiting.  While
/// the link is down requests queue up to the client capacity, then drop.
pub(crate) struct MqttNotifier {
    client: AsyncClient,
    topics: Topics,
}

impl MqttNotifier {
    pub(crate) fn new(client: AsyncClient, topics: Topics) -> Self {
        Self { client, topics }
    }
}

impl Notifier for MqttNotifier {
    fn publish(&mut self, note: Notification) {
        let (topic, payload) = self.topics.route(&note);
        match self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.into_bytes())
        {
            Ok(()) => debug!(topic, ?note, "published"),
            Err(e) => warn!(topic, "publish dropped: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Fixed-delay reconnect bookkeeping for the link task.
#[derive(Debug)]
pub(crate) struct Reconnect {
    delay: Duration,
    attempts: u32,
}

impl Reconnect {
    pub(crate) fn new(delay: Duration) -> Self {
        Self { delay, attempts: 0 }
    }

    /// Record a transport failure and return when to try again.
    pub(crate) fn failed(&mut self, now: Instant) -> Instant {
        self.attempts += 1;
        now + self.delay
    }

    pub(crate) fn connected(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// What the run loop hears from the broker connection.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Up,
    Message(Publish),
    Down(String),
}

/// The rumqttc event loop, driven by its own task.
///
/// `EventLoop::poll` makes connection progress inside its future, so it must
/// never be dropped mid-flight by a losing `select!` branch.  The task polls
/// to completion and forwards what matters over a channel whose `recv` is
/// cancel safe.
pub(crate) struct MqttLink {
    events: mpsc::Receiver<LinkEvent>,
    task: JoinHandle<()>,
}

impl MqttLink {
    pub(crate) fn spawn(mut eventloop: EventLoop, reconnect_delay: Duration) -> Self {
        let (tx, events) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            let mut reconnect = Reconnect::new(reconnect_delay);
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        reconnect.connected();
                        LinkEvent::Up
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => LinkEvent::Message(p),
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("broker sent disconnect");
                        LinkEvent::Down("broker disconnected".into())
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("disconnect sent, link closed");
                        return;
                    }
                    Ok(_) => continue,
                    Err(ConnectionError::RequestsDone) => {
                        debug!("all clients dropped, link closed");
                        return;
                    }
                    Err(e) => {
                        let retry_at = reconnect.failed(Instant::now());
                        warn!(
                            attempt = reconnect.attempts(),
                            "mqtt error: {e}. reconnecting in {}s",
                            reconnect_delay.as_secs()
                        );
                        if tx.send(LinkEvent::Down(e.to_string())).await.is_err() {
                            return;
                        }
                        sleep_until(retry_at).await;
                        continue;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Self { events, task }
    }

    /// Next event.  Cancel safe.
    pub(crate) async fn recv(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Ask the broker connection to disconnect and wait, up to `grace`, for
    /// everything queued before it to be written.
    pub(crate) async fn close(self, client: &AsyncClient, grace: Duration) {
        let Self { mut events, task } = self;
        if let Err(e) = client.try_disconnect() {
            warn!("disconnect request dropped: {e}");
        }
        let drain = async {
            while let Some(ev) = events.recv().await {
                debug!(?ev, "link event during shutdown");
            }
        };
        if timeout(grace, drain).await.is_err() {
            warn!(?grace, "mqtt link did not close in time, abandoning queued publishes");
            task.abort();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
