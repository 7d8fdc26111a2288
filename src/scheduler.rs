/*!
 # Override scheduling

 At most one override plays at a time. Starting a new one replaces the current
 one: its timer is cancelled and its pattern stopped before the new pattern
 starts. Timers never touch state themselves; when one runs out it posts
 [`Event::OverrideExpired`] to the service inbox and the expiry is handled in
 order with every other event. An expiry whose timer id no longer matches the
 active override is stale and ignored.
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time;
use tracing::{debug, info, instrument};

use crate::color::apply_brightness;
use crate::control::{ControlState, Override, OverrideKind};
use crate::device::LightDevice;
use crate::effects::PatternFrame;
use crate::message::Event;
use crate::observability::Health;
use crate::Result;

/// Cancellable reference to a pending override expiry.
/// Two handles are equal when they refer to the same timer.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl TimerHandle {
    /// A handle not backed by any task
    pub fn detached(id: u64) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancels the timer. Returns true only for the call that cancelled it.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerHandle {}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// How an override came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideEnd {
    /// Its timer ran out
    Expired,
    /// A newer override took its place
    Replaced,
    /// Power or ownership changed underneath it
    Interrupted,
}

impl OverrideEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideEnd::Expired => "complete",
            OverrideEnd::Replaced => "replaced",
            OverrideEnd::Interrupted => "interrupted",
        }
    }
}

pub struct OverrideScheduler {
    inbox: mpsc::Sender<Event>,
    next_id: u64,
}

impl OverrideScheduler {
    pub fn new(inbox: mpsc::Sender<Event>) -> Self {
        Self { inbox, next_id: 0 }
    }

    /// Spawns a timer that posts an expiry after `duration_seconds`
    pub fn arm(&mut self, kind: OverrideKind, duration_seconds: u32) -> TimerHandle {
        self.next_id += 1;
        let id = self.next_id;
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = cancelled.clone();
        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move {
            time::sleep(Duration::from_secs(u64::from(duration_seconds))).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            if inbox
                .send(Event::OverrideExpired { timer_id: id, kind })
                .await
                .is_err()
            {
                debug!(timer_id = id, "Inbox closed before override expiry");
            }
        });

        TimerHandle {
            id,
            cancelled,
            task: Some(task.abort_handle()),
        }
    }

    /// Starts an override, replacing the active one.
    ///
    /// The duration is checked before anything changes, so an invalid request
    /// leaves both the state and the running pattern untouched.
    #[instrument(skip(self, state, device, health, frames))]
    pub async fn start<D: LightDevice>(
        &mut self,
        state: &ControlState,
        device: &D,
        health: &mut Health,
        kind: OverrideKind,
        duration_seconds: i64,
        frames: Vec<PatternFrame>,
    ) -> Result<ControlState> {
        let duration = Override::validate_duration(duration_seconds)?;

        let base = match self.end(state, device, health, OverrideEnd::Replaced).await {
            Some(cleared) => cleared,
            None => state.clone(),
        };

        let timer = self.arm(kind, duration);
        let next = match base.start_override(kind, i64::from(duration), timer.clone()) {
            Ok(next) => next,
            Err(e) => {
                timer.cancel();
                return Err(e);
            }
        };
        health.record("start_pattern", device.start_pattern(frames).await);
        info!(
            override_kind = %kind,
            override_action = "start",
            duration_seconds = duration,
            timer_id = timer.id(),
            "Override started"
        );
        Ok(next)
    }

    /// Ends the active override, if any.
    ///
    /// Only an expiry puts the cached color back (or releases the light when
    /// this program no longer owns it or it is switched off). Replacements and
    /// interruptions leave the follow-up to the caller.
    pub async fn end<D: LightDevice>(
        &mut self,
        state: &ControlState,
        device: &D,
        health: &mut Health,
        how: OverrideEnd,
    ) -> Option<ControlState> {
        let active = state.active_override()?;
        let kind = active.kind();
        active.timer().cancel();
        health.record("stop_pattern", device.stop_pattern().await);

        let cleared = state.clear_override();
        if how == OverrideEnd::Expired {
            if cleared.pilot_switch() && cleared.light_on() {
                let color = apply_brightness(cleared.last_color(), cleared.last_brightness());
                health.record("set_static_color", device.set_static_color(color).await);
            } else {
                health.record("release", device.release().await);
            }
        }
        info!(override_kind = %kind, override_action = how.as_str(), "Override ended");
        Some(cleared)
    }

    /// Handles a timer that ran out. Stale ids return `None`.
    pub async fn expire<D: LightDevice>(
        &mut self,
        state: &ControlState,
        device: &D,
        health: &mut Health,
        timer_id: u64,
    ) -> Option<ControlState> {
        match state.active_override() {
            Some(active) if active.timer().id() == timer_id => {}
            _ => {
                debug!(timer_id, "Ignoring stale override expiry");
                return None;
            }
        }
        self.end(state, device, health, OverrideEnd::Expired).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Rgb;
    use crate::control::Mode;
    use crate::device::testing::{DeviceCall, RecordingDevice};
    use crate::effects::Palette;
    use crate::Error;

    fn setup() -> (OverrideScheduler, mpsc::Receiver<Event>, RecordingDevice, Health) {
        let (tx, rx) = mpsc::channel(8);
        (OverrideScheduler::new(tx), rx, RecordingDevice::default(), Health::default())
    }

    fn frames(kind: OverrideKind) -> Vec<PatternFrame> {
        Palette::builtin(kind).frames()
    }

    #[tokio::test(start_paused = true)]
    async fn timer_posts_expiry() {
        let (mut scheduler, mut rx, _, _) = setup();
        let handle = scheduler.arm(OverrideKind::Info, 2);

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::OverrideExpired { timer_id: handle.id(), kind: OverrideKind::Info }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_stays_silent() {
        let (mut scheduler, mut rx, _, _) = setup();
        let handle = scheduler.arm(OverrideKind::Alert, 1);

        assert!(handle.cancel());
        assert!(!handle.cancel());
        time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_cancels_previous_timer_once() {
        let (mut scheduler, mut rx, device, mut health) = setup();
        let state = ControlState::bootstrap(Rgb::new(0, 0, 255));

        let first = scheduler
            .start(&state, &device, &mut health, OverrideKind::Alert, 5, frames(OverrideKind::Alert))
            .await
            .unwrap();
        let first_timer = first.active_override().unwrap().timer().clone();

        let second = scheduler
            .start(&first, &device, &mut health, OverrideKind::Warning, 5, frames(OverrideKind::Warning))
            .await
            .unwrap();
        let second_timer = second.active_override().unwrap().timer().clone();

        assert_eq!(second.mode(), Mode::OverrideWarning);
        assert!(first_timer.is_cancelled());
        assert!(!first_timer.cancel());
        assert!(!second_timer.is_cancelled());
        assert_ne!(first_timer.id(), second_timer.id());
        assert_eq!(
            device.calls(),
            vec![
                DeviceCall::StartPattern(frames(OverrideKind::Alert)),
                DeviceCall::StopPattern,
                DeviceCall::StartPattern(frames(OverrideKind::Warning)),
            ]
        );

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::OverrideExpired { timer_id: second_timer.id(), kind: OverrideKind::Warning }
        );
        assert!(rx.try_recv().is_err());

        assert!(scheduler
            .expire(&second, &device, &mut health, first_timer.id())
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_duration_changes_nothing() {
        let (mut scheduler, _rx, device, mut health) = setup();
        let state = ControlState::bootstrap(Rgb::BLACK)
            .start_override(OverrideKind::Info, 30, TimerHandle::detached(99))
            .unwrap();

        let result = scheduler
            .start(&state, &device, &mut health, OverrideKind::Alert, 0, frames(OverrideKind::Alert))
            .await;

        assert!(matches!(result, Err(Error::InvalidOverride(_))));
        assert!(device.calls().is_empty());
        assert!(!state.active_override().unwrap().timer().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_restores_cached_color() {
        let (mut scheduler, _rx, device, mut health) = setup();
        let state = ControlState::bootstrap(Rgb::BLACK).record_color_command(Rgb::new(200, 100, 50), Some(128));
        let active = scheduler
            .start(&state, &device, &mut health, OverrideKind::Info, 5, frames(OverrideKind::Info))
            .await
            .unwrap();
        let timer_id = active.active_override().unwrap().timer().id();
        device.clear();

        let restored = scheduler.expire(&active, &device, &mut health, timer_id).await.unwrap();

        assert_eq!(restored.mode(), Mode::Pilot);
        assert_eq!(
            device.calls(),
            vec![
                DeviceCall::StopPattern,
                DeviceCall::SetStaticColor(Rgb::new(100, 50, 25)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_releases_when_not_owned() {
        let (mut scheduler, _rx, device, mut health) = setup();
        let state = ControlState::bootstrap(Rgb::BLACK);
        let active = scheduler
            .start(&state, &device, &mut health, OverrideKind::Alert, 5, frames(OverrideKind::Alert))
            .await
            .unwrap()
            .set_pilot_switch(false);
        let timer_id = active.active_override().unwrap().timer().id();
        device.clear();

        let restored = scheduler.expire(&active, &device, &mut health, timer_id).await.unwrap();

        assert_eq!(restored.mode(), Mode::Logi);
        assert_eq!(device.calls(), vec![DeviceCall::StopPattern, DeviceCall::Release]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_releases_when_light_is_off() {
        let (mut scheduler, _rx, device, mut health) = setup();
        let state = ControlState::bootstrap(Rgb::new(0, 128, 255)).set_light_state(false);
        let active = scheduler
            .start(&state, &device, &mut health, OverrideKind::Warning, 5, frames(OverrideKind::Warning))
            .await
            .unwrap();
        let timer_id = active.active_override().unwrap().timer().id();
        device.clear();

        let restored = scheduler.expire(&active, &device, &mut health, timer_id).await.unwrap();

        assert_eq!(restored.mode(), Mode::Pilot);
        assert!(!restored.light_on());
        assert_eq!(device.calls(), vec![DeviceCall::StopPattern, DeviceCall::Release]);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_does_not_reapply() {
        let (mut scheduler, _rx, device, mut health) = setup();
        let state = ControlState::bootstrap(Rgb::new(9, 9, 9));
        let active = scheduler
            .start(&state, &device, &mut health, OverrideKind::Alert, 5, frames(OverrideKind::Alert))
            .await
            .unwrap();
        device.clear();

        let cleared = scheduler
            .end(&active, &device, &mut health, OverrideEnd::Interrupted)
            .await
            .unwrap();

        assert_eq!(cleared.mode(), Mode::Pilot);
        assert_eq!(device.calls(), vec![DeviceCall::StopPattern]);
        assert!(scheduler
            .end(&cleared, &device, &mut health, OverrideEnd::Interrupted)
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn device_fault_is_recorded_not_fatal() {
        let (mut scheduler, _rx, device, mut health) = setup();
        device.set_failing(true);
        let state = ControlState::bootstrap(Rgb::BLACK);

        let next = scheduler
            .start(&state, &device, &mut health, OverrideKind::Warning, 3, frames(OverrideKind::Warning))
            .await
            .unwrap();

        assert_eq!(next.mode(), Mode::OverrideWarning);
        assert!(health.last_error().unwrap().contains("start_pattern"));
    }
}
