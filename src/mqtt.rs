/*!
 # MQTT transport

 Wraps a `rumqttc` [`AsyncClient`] and its event loop. The loop runs in its own
 task and turns broker traffic into [`Event`]s for the service inbox:
 `Connected` after every accepted session (subscriptions are requested first),
 `Message` for each publish on a subscribed topic and `Disconnected` when the
 connection drops. It reconnects on its own with a bounded backoff.
 Outbound publishes go through an [`Outbox`] drained by a second task.
*/

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, LastWill, MqttOptions, Packet,
    QoS,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::color::{json_integer, Rgb};
use crate::config::Profile;
use crate::control::RetainedState;
use crate::dispatcher::AVAILABILITY_OFFLINE;
use crate::message::{Event, InboundMessage, Publish};

const REQUEST_CAPACITY: usize = 64;
const OUTBOX_CAPACITY: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Connection options for the profile, with the last will set unless `suffix` is given
pub fn mqtt_options(profile: &Profile, suffix: Option<&str>) -> MqttOptions {
    let settings = &profile.mqtt;
    let client_id = match suffix {
        Some(suffix) => format!("{}-{suffix}", settings.client_id),
        None => settings.client_id.clone(),
    };
    let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
    options
        .set_keep_alive(Duration::from_secs(settings.keepalive))
        .set_clean_session(true);
    if let Some(username) = &settings.username {
        options.set_credentials(
            username.clone(),
            settings.password.clone().unwrap_or_default(),
        );
    }
    if suffix.is_none() {
        options.set_last_will(LastWill::new(
            profile.topics.availability.clone(),
            AVAILABILITY_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
    }
    options
}

/// Non-blocking queue of outbound publishes.
///
/// A publisher task drains it into the client, so the service loop never waits on
/// the client's request channel while the event loop waits on the service inbox.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Publish>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Publish>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues `message`; drops it with a warning when the publisher is behind
    pub fn offer(&self, message: Publish) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(%message, "Outbox full, dropping publish");
                false
            }
            Err(TrySendError::Closed(message)) => {
                debug!(%message, "Publisher stopped, dropping publish");
                false
            }
        }
    }
}

async fn run_publisher(client: AsyncClient, mut outbox: mpsc::Receiver<Publish>) {
    while let Some(message) = outbox.recv().await {
        trace!(%message, "Publishing");
        let result = client
            .publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                message.retain,
                message.payload.into_bytes(),
            )
            .await;
        if let Err(e) = result {
            warn!(topic = %message.topic, error = %e, "Publish failed");
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    outbox: Outbox,
    publisher: JoinHandle<()>,
    task: JoinHandle<()>,
}

impl MqttTransport {
    /// Starts the event loop and publisher tasks, feeding broker traffic to `inbox`
    pub fn spawn(profile: Arc<Profile>, inbox: mpsc::Sender<Event>) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(&profile, None), REQUEST_CAPACITY);
        info!(
            host = %profile.mqtt.host,
            port = profile.mqtt.port,
            client_id = %profile.mqtt.client_id,
            "Connecting to MQTT broker"
        );
        let (outbox, outgoing) = Outbox::channel(OUTBOX_CAPACITY);
        let publisher = tokio::spawn(run_publisher(client.clone(), outgoing));
        let task = tokio::spawn(run_event_loop(eventloop, client.clone(), profile, inbox));
        Self {
            client,
            outbox,
            publisher,
            task,
        }
    }

    pub fn publish(&self, message: Publish) -> bool {
        self.outbox.offer(message)
    }

    /// Flushes queued publishes, then requests a clean disconnect, all within a short grace period
    pub async fn disconnect(self) {
        let Self {
            client,
            outbox,
            mut publisher,
            mut task,
        } = self;
        drop(outbox);

        let stopped = time::timeout(DISCONNECT_GRACE, async {
            if let Err(e) = (&mut publisher).await {
                debug!(error = %e, "Publisher task failed");
            }
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "Disconnect request failed");
            }
            if let Err(e) = (&mut task).await {
                debug!(error = %e, "MQTT event loop task failed");
            }
        })
        .await;
        if stopped.is_err() {
            debug!("MQTT event loop did not stop in time");
            publisher.abort();
            task.abort();
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    profile: Arc<Profile>,
    inbox: mpsc::Sender<Event>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut connected = false;

    loop {
        let event = match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(code = ?ack.code, "Broker refused the connection");
                    continue;
                }
                for topic in profile.topics.subscriptions() {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        warn!(topic, error = %e, "Subscribe request failed");
                    }
                }
                info!("Connected to MQTT broker");
                connected = true;
                backoff = INITIAL_BACKOFF;
                Event::Connected
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                let message = InboundMessage::new(publish.topic, payload);
                debug!(%message, "Received");
                Event::Message(message)
            }
            Ok(MqttEvent::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping event loop");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, retry_in = ?backoff, "MQTT connection error");
                if connected {
                    connected = false;
                    if inbox.send(Event::Disconnected(e.to_string())).await.is_err() {
                        return;
                    }
                }
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        if inbox.send(event).await.is_err() {
            debug!("Service inbox closed, stopping event loop");
            return;
        }
    }
}

/// Reads the retained status snapshot, if the broker has one, within `timeout`
pub async fn read_retained_state(profile: &Profile, timeout: Duration) -> Option<RetainedState> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(profile, Some("bootstrap")), 10);
    let state_topic = profile.topics.state.clone();

    let read = async {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    if let Err(e) = client.try_subscribe(state_topic.as_str(), QoS::AtLeastOnce) {
                        warn!(error = %e, "Cannot subscribe for retained state");
                        return None;
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) if publish.topic == state_topic => {
                    return parse_retained_state(&publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Retained state read failed");
                    return None;
                }
            }
        }
    };

    let retained = time::timeout(timeout, read).await.ok().flatten();
    if let Err(e) = client.try_disconnect() {
        trace!(error = %e, "Bootstrap client disconnect failed");
    }
    match &retained {
        Some(state) => info!(?state, "Restored retained state"),
        None => debug!("No retained state found"),
    }
    retained
}

/// Extracts the restorable fields of a status snapshot
pub fn parse_retained_state(payload: &[u8]) -> Option<RetainedState> {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(payload) else {
        return None;
    };
    let on_off = |key: &str| match map.get(key)?.as_str()?.to_ascii_uppercase().as_str() {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    };
    let last_color = match map.get("last_color") {
        Some(Value::Array(items)) if items.len() == 3 => Some(Rgb::clamped(
            json_integer(&items[0])?,
            json_integer(&items[1])?,
            json_integer(&items[2])?,
        )),
        _ => None,
    };
    let last_brightness = map
        .get("last_brightness")
        .and_then(json_integer)
        .map(|value| value.clamp(0, 255) as u8);

    let state = RetainedState {
        pilot_switch: on_off("pilot_switch"),
        light_on: on_off("light_state"),
        last_color,
        last_brightness,
    };
    (state != RetainedState::default()).then_some(state)
}
