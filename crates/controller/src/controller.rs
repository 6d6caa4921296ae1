//! The irrigation controller: owns the schedule, the session and the single
//! wake timer, and turns inputs into side effects on the ports.
//!
//! ```text
//!  tick ───────────┐
//!  mqtt payload ───┼──▶ Controller ──▶ evaluate() ──▶ WakeTimer.arm
//!  button event ───┘         │
//!                            └──▶ valve / status / display / notifier / store
//! ```
//!
//! Every input is handled to completion before the next one is looked at.

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use crate::command::{self, Command};
use crate::display::{self, Frame};
use crate::panel::ButtonEvent;
use crate::ports::{
    Clock, Display, FlowCounter, Notification, Notifier, RecordStore, Status, StatusIndicator,
    Valve,
};
use crate::schedule::{erase_record, format_hms, rain_delay_in_effect, ScheduleConfig};
use crate::scheduler::{evaluate, Action, Outcome, Wake, WakeTimer};
use crate::session::{IrrigationSession, Mode};
use crate::state::EventKind;

/// Rain delay applied by the panel button.
const BUTTON_RAIN_DELAY_HOURS: u32 = 24;

const LINE_DRIPPING: &str = "Dripping";
const LINE_RAIN_DELAY: &str = "Rain Delay";
const LINE_RESETTING: &str = "Resetting";
const LINE_LINK_ERROR: &str = "MQTT Error";

/// Collaborators the controller drives.
pub struct Ports {
    pub clock: Box<dyn Clock>,
    pub valve: Box<dyn Valve>,
    pub flow: Box<dyn FlowCounter>,
    pub status: Box<dyn StatusIndicator>,
    pub display: Box<dyn Display>,
    pub notifier: Box<dyn Notifier>,
    pub store: Box<dyn RecordStore>,
}

/// What the run loop should do after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Leave the run loop so the supervisor restarts the process.
    Restart { factory_reset: bool },
}

/// Snapshot served by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub schedule: String,
    pub start_time: String,
    pub period_hours: u8,
    pub duration_minutes: u8,
    pub rain_delay_hours: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rain_delay_resume: Option<OffsetDateTime>,
    pub mode: Mode,
    #[serde(with = "time::serde::rfc3339::option")]
    pub session_started_at: Option<OffsetDateTime>,
    pub valve_open: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub planned_stop_at: Option<OffsetDateTime>,
    pub next_wake: Option<Wake>,
    pub display: Frame,
    pub mqtt_connected: bool,
}

pub struct Controller {
    schedule: ScheduleConfig,
    session: IrrigationSession,
    timer: WakeTimer,
    ports: Ports,
    display_line: String,
    display_target: Option<OffsetDateTime>,
    link_error: bool,
    mqtt_connected: bool,
    outbox: Vec<(EventKind, String)>,
}

impl Controller {
    pub fn new(schedule: ScheduleConfig, ports: Ports) -> Self {
        Self {
            schedule,
            session: IrrigationSession::default(),
            timer: WakeTimer::default(),
            ports,
            display_line: String::new(),
            display_target: None,
            link_error: false,
            mqtt_connected: false,
            outbox: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Restore the persisted schedule, force the valve closed and run the
    /// first evaluation.
    pub fn boot(&mut self) {
        self.schedule.restore(self.ports.store.as_mut());
        self.ports.valve.close();
        self.ports.status.set_status(Status::Stable);
        self.record(EventKind::System, format!("controller started: {}", self.schedule));
        self.reschedule(false);
    }

    /// Fire the pending wake if it is due.
    pub fn tick(&mut self) {
        let now = self.ports.clock.now();
        match self.timer.take_due(now) {
            Some(Action::Start) => {
                info!("scheduled start due");
                self.reschedule(false);
            }
            Some(Action::Stop) => self.stop_on_timer(),
            Some(Action::Reevaluate) => self.reschedule(false),
            None => {}
        }
    }

    /// Decode and execute one inbound payload.  Malformed payloads are
    /// logged and change nothing.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Control {
        match command::decode(payload) {
            Ok(cmd) => self.handle_command(cmd),
            Err(e) => {
                warn!(payload = %String::from_utf8_lossy(payload), "command rejected: {e}");
                self.record(EventKind::Error, format!("command rejected: {e}"));
                Control::Continue
            }
        }
    }

    pub fn handle_command(&mut self, cmd: Command) -> Control {
        info!(?cmd, "command");
        self.record(EventKind::Command, format!("{cmd:?}"));
        match cmd {
            Command::Configure {
                start,
                duration_minutes,
                period_hours,
            } => self.configure(&start, duration_minutes, period_hours),
            Command::RainDelay { hours } => self.set_rain_delay(hours),
            Command::StartManual { minutes } => self.start_manual(minutes),
            Command::StopManual => self.stop_manual(),
            Command::Restart => return self.restart(false),
            Command::ResetMeter => self.reset_meter(),
        }
        Control::Continue
    }

    pub fn handle_button(&mut self, event: ButtonEvent) -> Control {
        info!(?event, "button");
        match event {
            ButtonEvent::PressedAtBoot => return self.restart(true),
            ButtonEvent::VeryShort => self.toggle_valve(),
            ButtonEvent::Short => self.toggle_rain_delay(),
            ButtonEvent::Long => return self.restart(false),
        }
        Control::Continue
    }

    pub fn link_up(&mut self) {
        info!("mqtt connected");
        self.mqtt_connected = true;
        self.link_error = false;
        let status = self.settled_status();
        self.ports.status.set_status(status);
        self.record(EventKind::System, "mqtt connected".into());
        self.refresh_display();
    }

    pub fn link_down(&mut self, detail: &str) {
        self.mqtt_connected = false;
        if !self.link_error {
            self.record(EventKind::Error, format!("mqtt error: {detail}"));
        }
        self.link_error = true;
        let status = self.settled_status();
        self.ports.status.set_status(status);
        self.refresh_display();
    }

    /// Redraw both display lines for the current instant.
    pub fn refresh_display(&mut self) {
        let frame = self.frame(self.ports.clock.now());
        self.ports.display.render(&frame.primary, &frame.time_line);
    }

    pub fn status(&self) -> ControllerStatus {
        let now = self.ports.clock.now();
        ControllerStatus {
            schedule: self.schedule.to_string(),
            start_time: format_hms(self.schedule.start_time()),
            period_hours: self.schedule.period_hours(),
            duration_minutes: self.schedule.duration_minutes(),
            rain_delay_hours: self.schedule.rain_delay_hours(),
            rain_delay_resume: self
                .schedule
                .is_rain_delay_active()
                .then(|| self.schedule.rain_delay_resume()),
            mode: self.session.mode(),
            session_started_at: self.session.opened_at(),
            valve_open: self.ports.valve.is_open(),
            planned_stop_at: self.session.planned_stop_at(),
            next_wake: self.timer.pending(),
            display: self.frame(now),
            mqtt_connected: self.mqtt_connected,
        }
    }

    /// Journal entries produced since the last call.
    pub fn drain_events(&mut self) -> Vec<(EventKind, String)> {
        std::mem::take(&mut self.outbox)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Evaluate the schedule and act on the outcome.  `suppress_manual` is
    /// set only right after an operator stop.
    fn reschedule(&mut self, suppress_manual: bool) {
        let now = self.ports.clock.now();
        info!(schedule = %self.schedule, suppress_manual, "scheduling");
        self.ports
            .notifier
            .publish(Notification::ScheduleLine(self.schedule.to_string()));

        let eval = evaluate(now, &self.schedule, suppress_manual);
        match eval.outcome {
            Outcome::IrrigateNow { window, remaining } => {
                info!(?window, minutes = remaining.whole_minutes(), "window open, dripping");
                self.open_session(Mode::ScheduledWindow, now, Some(eval.wake.at));
            }
            Outcome::Wait(reason) => {
                info!(?reason, at = %eval.wake.at, action = ?eval.wake.action, "waiting");
                self.close_session();
            }
            Outcome::WaitUntilMidnight => {
                info!(at = %eval.wake.at, "done for today");
                self.close_session();
            }
        }

        self.display_line = eval.display_line().to_string();
        self.display_target = Some(eval.display_target);
        self.timer.arm(eval.wake);
        self.record(
            EventKind::Schedule,
            format!("{} until {}", eval.display_line(), eval.wake.at),
        );

        if !rain_delay_in_effect(&self.schedule, now) {
            if self.schedule.expire_rain_delay(now) {
                info!("rain delay over");
                self.record(EventKind::Schedule, "rain delay over".into());
            }
            self.ports.notifier.publish(Notification::RainDelayEnded);
        }

        self.refresh_display();
    }

    fn stop_on_timer(&mut self) {
        let manual = self.session.mode() == Mode::ManualOverride;
        info!(manual, "planned stop due");
        self.close_session();
        self.reschedule(manual);
    }

    // -----------------------------------------------------------------------
    // Session transitions
    // -----------------------------------------------------------------------

    fn open_session(
        &mut self,
        mode: Mode,
        now: OffsetDateTime,
        planned_stop_at: Option<OffsetDateTime>,
    ) {
        if !self.session.begin(mode, now, planned_stop_at) {
            return;
        }
        self.ports.valve.open();
        self.ports.notifier.publish(Notification::DripStarted);
        self.ports.status.set_status(Status::Irrigating);
        self.record(EventKind::Valve, format!("valve opened ({mode:?})"));
    }

    /// Close the valve.  Reports the flow and announces the stop only when a
    /// session was actually open.
    fn close_session(&mut self) {
        self.ports.valve.close();
        let Some(closed) = self.session.end() else {
            return;
        };
        let now = self.ports.clock.now();
        let minutes = (now - closed.opened_at).whole_minutes();
        self.ports.notifier.publish(Notification::DripStopped);
        self.report_flow();
        let status = self.settled_status();
        self.ports.status.set_status(status);
        info!(mode = ?closed.mode, minutes, "valve closed");
        self.record(
            EventKind::Valve,
            format!("valve closed ({:?}, {minutes} min)", closed.mode),
        );
    }

    fn report_flow(&mut self) {
        let liters = self.ports.flow.drain_liters();
        info!(liters, "flow report");
        self.ports.notifier.publish(Notification::FlowReport(liters));
    }

    fn start_manual(&mut self, minutes: u8) {
        if self.session.is_open() {
            warn!("already dripping, manual start ignored");
            self.record(EventKind::Command, "manual start ignored: already dripping".into());
            return;
        }
        let minutes = minutes.max(1);
        let now = self.ports.clock.now();
        let stop_at = now + Duration::minutes(i64::from(minutes));

        self.timer.detach();
        self.open_session(Mode::ManualOverride, now, Some(stop_at));
        self.timer.arm(Wake {
            at: stop_at,
            action: Action::Stop,
        });
        info!(minutes, "manual start");
        self.display_line = LINE_DRIPPING.to_string();
        self.display_target = Some(stop_at);
        self.refresh_display();
    }

    fn stop_manual(&mut self) {
        if !self.session.is_open() {
            warn!("not dripping, manual stop ignored");
            self.record(EventKind::Command, "manual stop ignored: not dripping".into());
            return;
        }
        info!("manual stop");
        self.timer.detach();
        self.close_session();
        self.reschedule(true);
    }

    /// Button very-short press: stop whatever is running, or open with no
    /// planned stop.
    fn toggle_valve(&mut self) {
        if self.session.is_open() {
            self.stop_manual();
            return;
        }
        let now = self.ports.clock.now();
        self.timer.detach();
        self.open_session(Mode::ManualOverride, now, None);
        self.display_line = LINE_DRIPPING.to_string();
        self.display_target = None;
        self.refresh_display();
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    fn toggle_rain_delay(&mut self) {
        if self.schedule.is_rain_delay_active() {
            self.set_rain_delay(0);
        } else {
            self.set_rain_delay(BUTTON_RAIN_DELAY_HOURS);
        }
    }

    /// `0` clears the delay.  The schedule is re-run only while the valve is
    /// closed; an open session finishes first.
    fn set_rain_delay(&mut self, hours: u32) {
        let now = self.ports.clock.now();
        self.schedule.set_rain_delay(hours, now);
        if hours > 0 {
            info!(hours, resume = %self.schedule.rain_delay_resume(), "rain delay set");
            self.ports
                .notifier
                .publish(Notification::RainDelaySet { hours });
            self.record(EventKind::Schedule, format!("rain delay {hours} h"));
            if self.session.is_open() {
                self.display_line = LINE_RAIN_DELAY.to_string();
                self.refresh_display();
            }
        } else {
            info!("rain delay cleared");
            self.record(EventKind::Schedule, "rain delay cleared".into());
        }

        if !self.session.is_open() {
            self.timer.detach();
            self.reschedule(false);
        }
    }

    fn configure(&mut self, start: &str, duration_minutes: u8, period_hours: u8) {
        self.schedule.set_duration_minutes(duration_minutes);
        self.schedule.set_period_hours(period_hours);
        if let Err(e) = self.schedule.set_start_time(start) {
            warn!(
                "configure: {e}, keeping start {}",
                format_hms(self.schedule.start_time())
            );
            self.record(EventKind::Error, format!("configure: {e}"));
        }
        info!(schedule = %self.schedule, "new configuration");

        if !self.session.is_open() {
            self.timer.detach();
            self.reschedule(false);
        }

        if let Err(e) = self.schedule.persist(self.ports.store.as_mut()) {
            error!("failed to save schedule: {e:#}");
            self.record(EventKind::Error, format!("save failed: {e:#}"));
        }
    }

    fn reset_meter(&mut self) {
        self.report_flow();
    }

    fn restart(&mut self, factory_reset: bool) -> Control {
        warn!(factory_reset, "restart requested");
        self.timer.detach();
        self.close_session();
        if factory_reset {
            if let Err(e) = erase_record(self.ports.store.as_mut()) {
                error!("failed to erase schedule record: {e:#}");
            }
        }
        self.display_line = LINE_RESETTING.to_string();
        self.display_target = None;
        self.refresh_display();
        self.record(
            EventKind::System,
            format!("restart (factory reset: {factory_reset})"),
        );
        Control::Restart { factory_reset }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn frame(&self, now: OffsetDateTime) -> Frame {
        if self.link_error && !self.session.is_open() {
            display::frame(LINE_LINK_ERROR, None, now)
        } else {
            display::frame(&self.display_line, self.display_target, now)
        }
    }

    /// Indicator state when nothing is dripping.
    fn settled_status(&self) -> Status {
        if self.session.is_open() {
            Status::Irrigating
        } else if self.link_error {
            Status::Error
        } else {
            Status::Stable
        }
    }

    fn record(&mut self, kind: EventKind, detail: String) {
        self.outbox.push((kind, detail));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
