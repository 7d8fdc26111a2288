//! The long-running bridge: one task owns the dispatcher and drains a single
//! inbox fed by the MQTT event loop, the override timers and Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Profile;
use crate::control::ControlState;
use crate::device::LightDevice;
use crate::dispatcher::Dispatcher;
use crate::message::{Event, Publish};
use crate::mqtt::{self, MqttTransport};
use crate::Result;

const INBOX_CAPACITY: usize = 128;
const RETAINED_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the bridge until Ctrl-C, then goes offline and hands the device back
pub async fn serve<D: LightDevice>(profile: Arc<Profile>, device: D) -> Result<()> {
    let initial = match mqtt::read_retained_state(&profile, RETAINED_READ_TIMEOUT).await {
        Some(retained) => ControlState::from_retained(profile.lighting.default_color, &retained),
        None => ControlState::bootstrap(profile.lighting.default_color),
    };

    let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
    let mut dispatcher = Dispatcher::new(profile.clone(), device, initial, tx.clone());
    dispatcher.startup().await;

    let transport = MqttTransport::spawn(profile.clone(), tx.clone());

    let shutdown_tx = tx;
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(Event::Shutdown).await;
    });

    let mut connected = false;
    while let Some(event) = rx.recv().await {
        let out = match event {
            Event::Shutdown => break,
            Event::Connected => {
                connected = true;
                dispatcher.on_connected()
            }
            Event::Disconnected(reason) => {
                warn!(%reason, "Broker connection lost; state kept in memory");
                connected = false;
                continue;
            }
            event => dispatcher.handle_event(event).await,
        };
        flush(&transport, connected, out);
    }

    let out = dispatcher.shutdown().await;
    flush(&transport, connected, out);
    transport.disconnect().await;
    info!("Stopped");
    Ok(())
}

fn flush(transport: &MqttTransport, connected: bool, out: Vec<Publish>) {
    if !connected {
        if !out.is_empty() {
            debug!(count = out.len(), "Offline, dropping publishes");
        }
        return;
    }
    for message in out {
        transport.publish(message);
    }
}
