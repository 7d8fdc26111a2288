/*!
 # Command dispatcher

 Owns the current [`ControlState`] and the device handle. Each inbound message
 is parsed, gated against ownership and power, turned into device calls and a
 new state, and answered with the retained publishes that describe the result.

 Gating:
 * color and brightness commands are ignored while this program does not own
   the light or the light is off, and cached without a device call while an
   override plays;
 * power-off interrupts any override and releases the light before flipping
   the state;
 * power-on reapplies the cached color (when owned) before flipping the state;
 * taking ownership back resynchronises the physical output, giving it up
   releases the light whatever the power state.
*/

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::color::{apply_brightness, Rgb};
use crate::command::{self, ModeCommand};
use crate::config::Profile;
use crate::control::{ControlState, OverrideKind};
use crate::device::LightDevice;
use crate::discovery;
use crate::echo::EchoFilter;
use crate::message::{Event, Publish};
use crate::observability::{self, override_reason, Health, HealthStatus};
use crate::scheduler::{OverrideEnd, OverrideScheduler};
use crate::Result;

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

pub struct Dispatcher<D: LightDevice> {
    profile: Arc<Profile>,
    device: D,
    state: ControlState,
    scheduler: OverrideScheduler,
    echo: EchoFilter,
    health: Health,
    validated_at: DateTime<Utc>,
}

impl<D: LightDevice> Dispatcher<D> {
    /// `inbox` receives override expiries; it must feed back into [`Dispatcher::handle_event`]
    pub fn new(
        profile: Arc<Profile>,
        device: D,
        initial: ControlState,
        inbox: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            profile,
            device,
            state: initial,
            scheduler: OverrideScheduler::new(inbox),
            echo: EchoFilter::new(),
            health: Health::default(),
            validated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    /// Takes the device and makes its output match the starting state
    pub async fn startup(&mut self) {
        self.health.begin();
        let result = self.device.start().await;
        self.health.record("start", result);
        self.resync_output().await;
        info!(mode = %self.state.mode(), light_on = self.state.light_on(), "Dispatcher ready");
    }

    /// Publishes sent after every (re)connection
    pub fn on_connected(&mut self) -> Vec<Publish> {
        let mut out = vec![Publish::retained(
            &self.profile.topics.availability,
            AVAILABILITY_ONLINE,
        )];
        self.push_status(&mut out, Some("connected"));
        self.push_mode(&mut out);
        self.push_health(&mut out, self.health.status());
        match discovery::discovery_messages(&self.profile) {
            Ok(messages) => out.extend(messages),
            Err(e) => error!(error = %e, "Cannot build discovery payload"),
        }
        out
    }

    pub async fn handle_event(&mut self, event: Event) -> Vec<Publish> {
        match event {
            Event::Message(message) => self.handle_message(&message.topic, &message.payload).await,
            Event::OverrideExpired { timer_id, .. } => self.handle_expiry(timer_id).await,
            Event::Connected => self.on_connected(),
            Event::Disconnected(_) | Event::Shutdown => Vec::new(),
        }
    }

    #[instrument(skip(self, payload))]
    pub async fn handle_message(&mut self, topic: &str, payload: &str) -> Vec<Publish> {
        let payload = payload.trim();
        let mut out = Vec::new();
        if self.echo.consume(topic, payload) {
            return out;
        }

        self.health.begin();
        let profile = self.profile.clone();
        let topics = &profile.topics;
        let result = if topic == topics.command {
            self.on_power(payload, &mut out).await
        } else if topic == topics.rgb {
            self.on_color(payload, &mut out).await
        } else if topic == topics.brightness {
            self.on_brightness(payload, &mut out).await
        } else if topic == topics.mode {
            self.on_mode(payload, &mut out).await
        } else if let Some(kind) = topics.override_kind(topic) {
            self.on_override(kind, payload, &mut out).await
        } else {
            debug!(payload, "Ignoring message on unhandled topic");
            return out;
        };

        if let Err(e) = result {
            warn!(payload, error = %e, "Rejected command");
            self.push_status(&mut out, Some("rejected"));
        }
        self.push_health(&mut out, self.health.status());
        out
    }

    /// Handles a timer firing; stale timers produce nothing
    pub async fn handle_expiry(&mut self, timer_id: u64) -> Vec<Publish> {
        let mut out = Vec::new();
        let kind = match self.state.active_override() {
            Some(active) if active.timer().id() == timer_id => active.kind(),
            _ => {
                debug!(timer_id, "Ignoring stale override expiry");
                return out;
            }
        };

        self.health.begin();
        if let Some(next) = self
            .scheduler
            .expire(&self.state, &self.device, &mut self.health, timer_id)
            .await
        {
            self.commit(next, &override_reason(kind, "complete"), &mut out);
            self.push_health(&mut out, self.health.status());
        }
        out
    }

    /// Stops any override, hands the device back and announces going offline
    pub async fn shutdown(&mut self) -> Vec<Publish> {
        let mut out = Vec::new();
        if let Some(next) = self
            .scheduler
            .end(&self.state, &self.device, &mut self.health, OverrideEnd::Interrupted)
            .await
        {
            self.state = next;
        }
        let result = self.device.shutdown().await;
        self.health.record("shutdown", result);

        self.push_status(&mut out, Some("shutdown"));
        self.push_health(&mut out, HealthStatus::Offline);
        out.push(Publish::retained(
            &self.profile.topics.availability,
            AVAILABILITY_OFFLINE,
        ));
        out
    }

    async fn on_power(&mut self, payload: &str, out: &mut Vec<Publish>) -> Result<()> {
        if command::parse_power(payload)? {
            self.power_on(out).await;
        } else {
            self.power_off(out).await;
        }
        Ok(())
    }

    async fn power_on(&mut self, out: &mut Vec<Publish>) {
        if self.state.pilot_switch() && self.state.active_override().is_none() {
            self.write_cached_color().await;
        }
        let next = self.state.set_light_state(true);
        self.commit(next, "power_on", out);
    }

    async fn power_off(&mut self, out: &mut Vec<Publish>) {
        self.interrupt_override("light_off", out).await;
        let result = self.device.release().await;
        self.health.record("release", result);
        let next = self.state.set_light_state(false);
        self.commit(next, "power_off", out);
    }

    async fn on_color(&mut self, payload: &str, out: &mut Vec<Publish>) -> Result<()> {
        let command = command::parse_color_command(payload)?;
        match command.state {
            Some(false) => {
                self.power_off(out).await;
                return Ok(());
            }
            Some(true) if command.is_state_only() => {
                self.power_on(out).await;
                return Ok(());
            }
            Some(true) if !self.state.light_on() => {
                self.state = self.state.set_light_state(true);
            }
            _ => {}
        }
        self.apply_color(command.color, command.brightness, "color_command", out)
            .await;
        Ok(())
    }

    async fn on_brightness(&mut self, payload: &str, out: &mut Vec<Publish>) -> Result<()> {
        let brightness = command::parse_brightness(payload)?;
        self.apply_color(None, Some(i64::from(brightness)), "brightness_command", out)
            .await;
        Ok(())
    }

    async fn apply_color(
        &mut self,
        color: Option<Rgb>,
        brightness: Option<i64>,
        reason: &str,
        out: &mut Vec<Publish>,
    ) {
        if !self.state.pilot_switch() {
            info!(reason, "Color change ignored while control is ceded");
            self.push_status(out, Some("color_ignored_pilot_off"));
            return;
        }
        if !self.state.light_on() {
            info!(reason, "Color change ignored while the light is off");
            self.push_status(out, Some("color_ignored_light_off"));
            return;
        }

        let base = color.unwrap_or(self.state.last_color());
        let next = self.state.record_color_command(base, brightness);
        if let Some(active) = self.state.active_override() {
            let kind = active.kind();
            info!(
                override_kind = %kind,
                color = %next.last_color(),
                brightness = next.last_brightness(),
                "Color cached until the override ends"
            );
            self.commit(next, &override_reason(kind, "color_cached"), out);
            return;
        }

        self.state = next;
        self.write_cached_color().await;
        self.push_status(out, Some(reason));
    }

    async fn on_mode(&mut self, payload: &str, out: &mut Vec<Publish>) -> Result<()> {
        let desired = match command::parse_mode(payload) {
            Ok(desired) => desired,
            Err(e) => {
                self.push_mode(out);
                return Err(e);
            }
        };
        let owned = self.state.pilot_switch();
        match desired {
            ModeCommand::Pilot if owned => self.push_mode(out),
            ModeCommand::Logi if !owned => self.push_mode(out),
            ModeCommand::Pilot => self.enter_pilot(out).await,
            ModeCommand::Logi => self.exit_pilot(out).await,
        }
        Ok(())
    }

    async fn enter_pilot(&mut self, out: &mut Vec<Publish>) {
        self.interrupt_override("pilot_toggle", out).await;
        self.state = self.state.set_pilot_switch(true);
        self.resync_output().await;
        self.push_status(out, Some("pilot_enable"));
        self.push_mode(out);
        info!("Pilot mode enabled");
    }

    async fn exit_pilot(&mut self, out: &mut Vec<Publish>) {
        self.interrupt_override("pilot_toggle", out).await;
        let result = self.device.stop_pattern().await;
        self.health.record("stop_pattern", result);
        let result = self.device.release().await;
        self.health.record("release", result);
        let next = self.state.set_pilot_switch(false);
        self.commit(next, "pilot_disable", out);
        self.push_mode(out);
        info!("Pilot mode disabled, control handed back");
    }

    async fn on_override(
        &mut self,
        topic_kind: OverrideKind,
        payload: &str,
        out: &mut Vec<Publish>,
    ) -> Result<()> {
        let request = command::parse_override(
            payload,
            topic_kind,
            self.profile.effects.override_duration_seconds,
        )?;
        let frames = self.profile.palettes.get(request.kind).frames();
        let next = self
            .scheduler
            .start(
                &self.state,
                &self.device,
                &mut self.health,
                request.kind,
                request.duration_seconds,
                frames,
            )
            .await?;
        self.commit(next, &override_reason(request.kind, "start"), out);
        Ok(())
    }

    /// Ends the active override, if any, publishing `{kind}_{cause}` as the reason
    async fn interrupt_override(&mut self, cause: &str, out: &mut Vec<Publish>) {
        let Some(kind) = self.state.active_override().map(|active| active.kind()) else {
            return;
        };
        if let Some(next) = self
            .scheduler
            .end(&self.state, &self.device, &mut self.health, OverrideEnd::Interrupted)
            .await
        {
            self.commit(next, &override_reason(kind, cause), out);
        }
    }

    /// Owned and on: cached color at cached brightness. Otherwise release.
    async fn resync_output(&mut self) {
        if self.state.pilot_switch() && self.state.light_on() {
            self.write_cached_color().await;
        } else {
            let result = self.device.release().await;
            self.health.record("release", result);
        }
    }

    async fn write_cached_color(&mut self) {
        let color = apply_brightness(self.state.last_color(), self.state.last_brightness());
        let result = self.device.set_static_color(color).await;
        self.health.record("set_static_color", result);
    }

    fn commit(&mut self, next: ControlState, reason: &str, out: &mut Vec<Publish>) {
        self.state = next;
        self.push_status(out, Some(reason));
    }

    fn push_status(&self, out: &mut Vec<Publish>, reason: Option<&str>) {
        match observability::status_payload(&self.state, reason) {
            Ok(payload) => out.push(Publish::retained(&self.profile.topics.state, payload)),
            Err(e) => error!(error = %e, "Cannot serialize status"),
        }
    }

    fn push_mode(&mut self, out: &mut Vec<Publish>) {
        let value = if self.state.pilot_switch() {
            ModeCommand::Pilot
        } else {
            ModeCommand::Logi
        };
        let topic = &self.profile.topics.mode;
        self.echo.record(topic, value.as_str());
        out.push(Publish::retained(topic, value.as_str()));
    }

    fn push_health(&self, out: &mut Vec<Publish>, status: HealthStatus) {
        match observability::health_payload(&self.profile, status, self.validated_at, &self.health) {
            Ok(payload) => out.push(Publish::retained(
                &self.profile.observability.health_topic,
                payload,
            )),
            Err(e) => error!(error = %e, "Cannot serialize health"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::control::Mode;
    use crate::device::testing::{DeviceCall, RecordingDevice};
    use crate::effects::Palette;

    const STATE: &str = "lightspeed/alerts/status";
    const SWITCH: &str = "lightspeed/alerts/switch";
    const RGB: &str = "lightspeed/alerts/rgb/set";
    const BRIGHTNESS: &str = "lightspeed/alerts/brightness/set";
    const MODE: &str = "lightspeed/alerts/mode/set";
    const ALERT: &str = "lightspeed/alerts/alert";
    const WARN: &str = "lightspeed/alerts/warn";
    const HEALTH: &str = "lightspeed/alerts/health";
    const AVAILABILITY: &str = "lightspeed/alerts/availability";

    fn dispatcher() -> (Dispatcher<RecordingDevice>, mpsc::Receiver<Event>) {
        let profile = Profile::from_toml_str(
            "[mqtt]\nhost = \"localhost\"\n[lighting]\ndefault_color = \"#0080FF\"\n",
            "config.toml",
            |_| None,
        )
        .unwrap();
        let initial = ControlState::bootstrap(profile.lighting.default_color);
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(Arc::new(profile), RecordingDevice::default(), initial, tx);
        (dispatcher, rx)
    }

    fn last_json(out: &[Publish], topic: &str) -> Value {
        let publish = out
            .iter()
            .rev()
            .find(|publish| publish.topic == topic)
            .unwrap_or_else(|| panic!("no publish on {topic}"));
        serde_json::from_str(&publish.payload).unwrap()
    }

    fn status_reasons(out: &[Publish]) -> Vec<String> {
        out.iter()
            .filter(|publish| publish.topic == STATE)
            .map(|publish| {
                let status: Value = serde_json::from_str(&publish.payload).unwrap();
                status["reason"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    fn active_timer(dispatcher: &Dispatcher<RecordingDevice>) -> u64 {
        dispatcher.state().active_override().unwrap().timer().id()
    }

    fn has_color_write(calls: &[DeviceCall]) -> bool {
        calls
            .iter()
            .any(|call| matches!(call, DeviceCall::SetStaticColor(_)))
    }

    #[tokio::test]
    async fn startup_applies_default_color() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.startup().await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::Start, DeviceCall::SetStaticColor(Rgb::new(0, 128, 255))]
        );
    }

    #[tokio::test]
    async fn color_command_writes_scaled_color() {
        let (mut dispatcher, _rx) = dispatcher();
        let out = dispatcher
            .handle_message(RGB, r#"{"color":{"r":200,"g":100,"b":50},"brightness":128}"#)
            .await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::SetStaticColor(Rgb::new(100, 50, 25))]
        );
        assert_eq!(dispatcher.state().last_color(), Rgb::new(200, 100, 50));
        assert_eq!(dispatcher.state().last_brightness(), 128);

        let status = last_json(&out, STATE);
        assert_eq!(status["reason"], "color_command");
        assert_eq!(status["last_brightness"], 128);
        assert_eq!(last_json(&out, HEALTH)["status"], "online");
        assert!(out.iter().all(|publish| publish.retain));
    }

    #[tokio::test]
    async fn brightness_keeps_cached_color() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(RGB, "#C86432").await;
        dispatcher.device().clear();

        dispatcher.handle_message(BRIGHTNESS, "128").await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::SetStaticColor(Rgb::new(100, 50, 25))]
        );
        assert_eq!(dispatcher.state().last_color(), Rgb::new(200, 100, 50));
    }

    #[tokio::test]
    async fn color_during_override_is_cached_then_restored() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(ALERT, "5").await;
        assert_eq!(dispatcher.state().mode(), Mode::OverrideAlert);
        dispatcher.device().clear();

        let out = dispatcher.handle_message(RGB, "10,20,30").await;

        assert!(dispatcher.device().calls().is_empty());
        assert_eq!(dispatcher.state().last_color(), Rgb::new(10, 20, 30));
        assert_eq!(last_json(&out, STATE)["reason"], "alert_color_cached");

        let timer_id = active_timer(&dispatcher);
        let out = dispatcher.handle_expiry(timer_id).await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::StopPattern, DeviceCall::SetStaticColor(Rgb::new(10, 20, 30))]
        );
        assert_eq!(dispatcher.state().mode(), Mode::Pilot);
        assert_eq!(last_json(&out, STATE)["reason"], "alert_complete");
    }

    #[tokio::test]
    async fn color_is_ignored_when_control_is_ceded() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(MODE, "logi").await;
        dispatcher.device().clear();
        let before = dispatcher.state().clone();

        let out = dispatcher.handle_message(RGB, "#FF0000").await;

        assert!(dispatcher.device().calls().is_empty());
        assert_eq!(dispatcher.state(), &before);
        assert_eq!(last_json(&out, STATE)["reason"], "color_ignored_pilot_off");
    }

    #[tokio::test]
    async fn color_is_ignored_when_light_is_off() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(SWITCH, "OFF").await;
        dispatcher.device().clear();

        let out = dispatcher.handle_message(BRIGHTNESS, "10").await;

        assert!(dispatcher.device().calls().is_empty());
        assert_eq!(dispatcher.state().last_brightness(), 255);
        assert_eq!(last_json(&out, STATE)["reason"], "color_ignored_light_off");
    }

    #[tokio::test]
    async fn json_state_on_turns_light_on_before_gating() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(SWITCH, "OFF").await;
        dispatcher.device().clear();

        dispatcher
            .handle_message(RGB, r#"{"state":"ON","rgb_color":[1,2,3]}"#)
            .await;

        assert!(dispatcher.state().light_on());
        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::SetStaticColor(Rgb::new(1, 2, 3))]
        );
    }

    #[tokio::test]
    async fn power_off_interrupts_override_and_releases() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(WARN, "").await;
        let timer = dispatcher.state().active_override().unwrap().timer().clone();
        dispatcher.device().clear();

        let out = dispatcher.handle_message(SWITCH, "off").await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::StopPattern, DeviceCall::Release]
        );
        assert!(timer.is_cancelled());
        assert!(!dispatcher.state().light_on());
        assert_eq!(dispatcher.state().mode(), Mode::Pilot);
        assert_eq!(last_json(&out, STATE)["state"], "OFF");
        assert_eq!(last_json(&out, STATE)["reason"], "power_off");
        assert_eq!(status_reasons(&out), vec!["warning_light_off", "power_off"]);
    }

    #[tokio::test]
    async fn override_expiry_with_light_off_releases() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(SWITCH, "OFF").await;
        dispatcher.handle_message(ALERT, "5").await;
        assert_eq!(dispatcher.state().mode(), Mode::OverrideAlert);
        dispatcher.device().clear();

        let timer_id = active_timer(&dispatcher);
        let out = dispatcher.handle_expiry(timer_id).await;
        let calls = dispatcher.device().calls();

        assert_eq!(calls, vec![DeviceCall::StopPattern, DeviceCall::Release]);
        assert!(!has_color_write(&calls));
        assert!(!dispatcher.state().light_on());
        assert_eq!(last_json(&out, STATE)["reason"], "alert_complete");
    }

    #[tokio::test]
    async fn power_on_reapplies_cached_color() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(RGB, r#"{"r":40,"g":80,"b":120,"brightness":255}"#).await;
        dispatcher.handle_message(SWITCH, "OFF").await;
        dispatcher.device().clear();

        dispatcher.handle_message(SWITCH, "ON").await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::SetStaticColor(Rgb::new(40, 80, 120))]
        );
        assert!(dispatcher.state().light_on());
    }

    #[tokio::test]
    async fn ceding_control_during_override_releases_without_reapply() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(ALERT, "30").await;
        dispatcher.device().clear();

        let out = dispatcher.handle_message(MODE, "logi").await;
        let calls = dispatcher.device().calls();

        assert!(dispatcher.state().active_override().is_none());
        assert_eq!(dispatcher.state().mode(), Mode::Logi);
        assert!(calls.contains(&DeviceCall::Release));
        assert!(!has_color_write(&calls));
        assert_eq!(out.iter().find(|p| p.topic == MODE).unwrap().payload, "logi");
        assert_eq!(status_reasons(&out), vec!["alert_pilot_toggle", "pilot_disable"]);
    }

    #[tokio::test]
    async fn taking_control_back_resyncs_output() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(MODE, "logi").await;
        dispatcher.device().clear();

        dispatcher.handle_message(MODE, "pilot").await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::SetStaticColor(Rgb::new(0, 128, 255))]
        );
        assert_eq!(dispatcher.state().mode(), Mode::Pilot);
    }

    #[tokio::test]
    async fn taking_control_back_while_off_releases() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(SWITCH, "OFF").await;
        dispatcher.handle_message(MODE, "logi").await;
        dispatcher.device().clear();

        dispatcher.handle_message(MODE, "pilot").await;

        assert_eq!(dispatcher.device().calls(), vec![DeviceCall::Release]);
        assert!(!dispatcher.state().light_on());
    }

    #[tokio::test]
    async fn replacing_override_ignores_previous_expiry() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(ALERT, "5").await;
        let first = active_timer(&dispatcher);
        dispatcher.handle_message(WARN, "5").await;
        let second = active_timer(&dispatcher);

        assert_ne!(first, second);
        assert_eq!(dispatcher.state().mode(), Mode::OverrideWarning);
        assert_eq!(
            dispatcher.device().calls(),
            vec![
                DeviceCall::StartPattern(Palette::builtin(OverrideKind::Alert).frames()),
                DeviceCall::StopPattern,
                DeviceCall::StartPattern(Palette::builtin(OverrideKind::Warning).frames()),
            ]
        );

        dispatcher.device().clear();
        assert!(dispatcher.handle_expiry(first).await.is_empty());
        assert!(dispatcher.device().calls().is_empty());
        assert_eq!(dispatcher.state().mode(), Mode::OverrideWarning);
    }

    #[tokio::test]
    async fn invalid_override_leaves_state_untouched() {
        let (mut dispatcher, _rx) = dispatcher();
        let before = dispatcher.state().clone();

        for payload in [r#"{"type":"bogus","duration":5}"#, "0", "301"] {
            let out = dispatcher.handle_message(ALERT, payload).await;
            assert_eq!(dispatcher.state(), &before);
            assert_eq!(last_json(&out, STATE)["reason"], "rejected");
        }
        assert!(dispatcher.device().calls().is_empty());
    }

    #[tokio::test]
    async fn override_type_in_payload_wins() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher
            .handle_message(ALERT, r#"{"type":"info","duration":7}"#)
            .await;

        let active = dispatcher.state().active_override().unwrap();
        assert_eq!(active.kind(), OverrideKind::Info);
        assert_eq!(active.duration_seconds(), 7);
    }

    #[tokio::test]
    async fn malformed_commands_republish_status() {
        let (mut dispatcher, _rx) = dispatcher();
        let before = dispatcher.state().clone();

        let out = dispatcher.handle_message(BRIGHTNESS, "999").await;
        assert_eq!(last_json(&out, STATE)["reason"], "rejected");

        let out = dispatcher.handle_message(MODE, "sideways").await;
        assert_eq!(out.iter().find(|p| p.topic == MODE).unwrap().payload, "pilot");

        dispatcher.handle_message(SWITCH, "maybe").await;
        assert_eq!(dispatcher.state(), &before);
        assert!(dispatcher.device().calls().is_empty());
    }

    #[tokio::test]
    async fn own_mode_publish_is_not_reprocessed() {
        let (mut dispatcher, _rx) = dispatcher();
        let connected = dispatcher.on_connected();
        assert!(connected.iter().any(|p| p.topic == MODE && p.payload == "pilot"));

        assert!(dispatcher.handle_message(MODE, "pilot").await.is_empty());
        assert!(!dispatcher.handle_message(MODE, "pilot").await.is_empty());
    }

    #[tokio::test]
    async fn device_failure_is_reported_not_rolled_back() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.device().set_failing(true);

        let out = dispatcher.handle_message(RGB, "#010203").await;

        assert_eq!(dispatcher.state().last_color(), Rgb::new(1, 2, 3));
        let health = last_json(&out, HEALTH);
        assert_eq!(health["status"], "error");
        assert!(health["last_error"].as_str().unwrap().contains("set_static_color"));

        dispatcher.device().set_failing(false);
        let out = dispatcher.handle_message(RGB, "#040506").await;
        assert_eq!(last_json(&out, HEALTH)["status"], "online");
    }

    #[tokio::test]
    async fn connect_announces_everything() {
        let (mut dispatcher, _rx) = dispatcher();
        let out = dispatcher.on_connected();

        assert_eq!(out[0], Publish::retained(AVAILABILITY, AVAILABILITY_ONLINE));
        assert_eq!(last_json(&out, STATE)["reason"], "connected");
        assert_eq!(last_json(&out, HEALTH)["status"], "online");
        assert!(out
            .iter()
            .any(|p| p.topic == "homeassistant/device/lightspeed-alerts/config"));
    }

    #[tokio::test]
    async fn shutdown_goes_offline() {
        let (mut dispatcher, _rx) = dispatcher();
        dispatcher.handle_message(ALERT, "").await;
        dispatcher.device().clear();

        let out = dispatcher.shutdown().await;

        assert_eq!(
            dispatcher.device().calls(),
            vec![DeviceCall::StopPattern, DeviceCall::Shutdown]
        );
        assert_eq!(out.last().unwrap().payload, AVAILABILITY_OFFLINE);
        assert_eq!(last_json(&out, HEALTH)["status"], "offline");
        assert!(last_json(&out, STATE).get("override").is_none());
    }

    #[tokio::test]
    async fn unknown_topics_are_ignored() {
        let (mut dispatcher, _rx) = dispatcher();
        assert!(dispatcher.handle_message("elsewhere/topic", "ON").await.is_empty());
        assert!(dispatcher.device().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_arrives_through_the_inbox() {
        let (mut dispatcher, mut rx) = dispatcher();
        dispatcher.handle_message(ALERT, "2").await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::OverrideExpired { kind: OverrideKind::Alert, .. }));
        dispatcher.handle_event(event).await;

        assert_eq!(dispatcher.state().mode(), Mode::Pilot);
    }
}
