//! TOML deployment config: broker, pins, schedule defaults and device timing.
//!
//! Every section is optional.  A missing file is the same as an empty one.

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::UtcOffset;

use crate::clock::LocalZone;
use crate::panel::ButtonClassifier;
use crate::schedule::{
    format_hms, parse_start_time, ScheduleConfig, DEFAULT_DURATION_MINUTES, DEFAULT_PERIOD_HOURS,
    DEFAULT_START,
};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub gpio: GpioSection,
    pub schedule: ScheduleSection,
    pub device: DeviceSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    /// A random hex suffix is appended per process.
    pub client_prefix: String,
    pub keep_alive_sec: u64,
    pub reconnect_delay_sec: u64,
    pub topic_prefix: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_prefix: "DripCtrl-".into(),
            keep_alive_sec: 30,
            reconnect_delay_sec: 5,
            topic_prefix: "/home-assistant/drip".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioSection {
    pub valve_pin: i64,
    pub flow_pin: i64,
    pub status_led_pin: i64,
    pub button_pin: i64,
    /// Many common relay boards are active-low.
    pub relay_active_low: bool,
}

impl Default for GpioSection {
    fn default() -> Self {
        Self {
            valve_pin: 12,
            flow_pin: 13,
            status_led_pin: 14,
            button_pin: 16,
            relay_active_low: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub start_time: String,
    pub period_hours: u8,
    pub duration_minutes: u8,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            start_time: format_hms(DEFAULT_START),
            period_hours: DEFAULT_PERIOD_HOURS,
            duration_minutes: DEFAULT_DURATION_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// IANA zone name.  Empty means the fixed `utc_offset_minutes`.
    pub timezone: String,
    pub utc_offset_minutes: i32,
    pub store_path: PathBuf,
    pub display_refresh_sec: u64,
    pub tick_ms: u64,
    pub pulses_per_liter: u64,
    pub button_very_short_ms: u64,
    pub button_long_ms: u64,
    pub web_port: u16,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".into(),
            utc_offset_minutes: 0,
            store_path: PathBuf::from("dripctl.rec"),
            display_refresh_sec: 60,
            tick_ms: 500,
            pulses_per_liter: 450,
            button_very_short_ms: 2000,
            button_long_ms: 8000,
            web_port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// `time::UtcOffset` accepts up to ±25:59:59, real zones stay within ±18 h.
const MAX_OFFSET_MINUTES: i32 = 18 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_gpio(&mut errors);
        self.validate_schedule(&mut errors);
        self.validate_device(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.topic_prefix.trim().is_empty() {
            errors.push("mqtt: topic_prefix is empty".into());
        } else if m.topic_prefix.contains(['+', '#']) {
            errors.push(format!(
                "mqtt: topic_prefix '{}' must not contain wildcards",
                m.topic_prefix
            ));
        }
        if m.reconnect_delay_sec == 0 {
            errors.push("mqtt: reconnect_delay_sec must be positive".into());
        }
        if m.keep_alive_sec == 0 {
            errors.push("mqtt: keep_alive_sec must be positive".into());
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (name, pin) in self.pins() {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "gpio: {name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("gpio: {name} {pin} is already used by another pin"));
            }
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let s = &self.schedule;
        if let Err(e) = parse_start_time(&s.start_time) {
            errors.push(format!("schedule: {e}"));
        }
        if s.period_hours % 6 != 0 || s.period_hours > 24 {
            errors.push(format!(
                "schedule: period_hours {} must be a multiple of 6 no greater than 24",
                s.period_hours
            ));
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if d.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            errors.push(format!(
                "device: utc_offset_minutes {} out of range [-{MAX_OFFSET_MINUTES}, {MAX_OFFSET_MINUTES}]",
                d.utc_offset_minutes
            ));
        }
        if !d.timezone.is_empty() && d.timezone.parse::<Tz>().is_err() {
            errors.push(format!("device: unknown timezone '{}'", d.timezone));
        }
        if d.tick_ms == 0 {
            errors.push("device: tick_ms must be positive".into());
        }
        if d.display_refresh_sec == 0 {
            errors.push("device: display_refresh_sec must be positive".into());
        }
        if d.pulses_per_liter == 0 {
            errors.push("device: pulses_per_liter must be positive".into());
        }
        if d.button_very_short_ms >= d.button_long_ms {
            errors.push(format!(
                "device: button_very_short_ms ({}) must be below button_long_ms ({})",
                d.button_very_short_ms, d.button_long_ms
            ));
        }
        if d.store_path.as_os_str().is_empty() {
            errors.push("device: store_path is empty".into());
        }
    }

    fn pins(&self) -> [(&'static str, i64); 4] {
        let g = &self.gpio;
        [
            ("valve_pin", g.valve_pin),
            ("flow_pin", g.flow_pin),
            ("status_led_pin", g.status_led_pin),
            ("button_pin", g.button_pin),
        ]
    }

    // -- Derived values (only meaningful after validate) -----------------

    pub fn local_zone(&self) -> Result<LocalZone> {
        let d = &self.device;
        if d.timezone.is_empty() {
            let offset = UtcOffset::from_whole_seconds(d.utc_offset_minutes * 60)
                .with_context(|| format!("bad utc offset {} min", d.utc_offset_minutes))?;
            return Ok(LocalZone::Fixed(offset));
        }
        let tz = d
            .timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("bad timezone '{}': {e}", d.timezone))?;
        Ok(LocalZone::Named(tz))
    }

    /// Compiled-in schedule overridden by the `[schedule]` section.
    pub fn initial_schedule(&self, now: time::OffsetDateTime) -> Result<ScheduleConfig> {
        let mut schedule = ScheduleConfig::with_defaults(now);
        schedule.set_start_time(&self.schedule.start_time)?;
        schedule.set_period_hours(self.schedule.period_hours);
        schedule.set_duration_minutes(self.schedule.duration_minutes);
        Ok(schedule)
    }

    pub fn button_classifier(&self) -> ButtonClassifier {
        ButtonClassifier {
            very_short: Duration::from_millis(self.device.button_very_short_ms),
            long: Duration::from_millis(self.device.button_long_ms),
        }
    }

    pub fn client_id(&self) -> String {
        let suffix = std::process::id() ^ (time::OffsetDateTime::now_utc().nanosecond());
        format!("{}{:04x}", self.mqtt.client_prefix, suffix & 0xffff)
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT` and `WEB_PORT` on top of the file.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(port) = var("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.device.web_port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply env overrides and validate.  A missing file yields
/// the defaults.
pub fn load(path: &Path) -> Result<Config> {
    let mut config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config: {}", path.display()))
        }
    };

    config.apply_env(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
