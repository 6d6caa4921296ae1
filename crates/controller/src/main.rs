mod clock;
mod command;
mod config;
mod controller;
mod display;
mod flow;
mod mqtt;
mod panel;
mod ports;
mod schedule;
mod scheduler;
mod session;
mod state;
mod store;
mod valve;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use controller::{Control, Controller, Ports};
use display::ConsoleDisplay;
use flow::FlowMeter;
use mqtt::{LinkEvent, MqttLink, MqttNotifier, Topics};
use panel::StatusLed;
use ports::Clock;
use state::{SharedState, SystemState};
use store::FileStore;
use valve::SolenoidValve;

/// How long a restart waits for queued notifications to reach the broker.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("drip_controller=info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path =
        PathBuf::from(env::var("CONFIG_PATH").unwrap_or_else(|_| "dripctl.toml".to_string()));
    let cfg = config::load(&config_path)?;

    let zone = cfg.local_zone()?;
    info!(?zone, "local time zone");
    let clock = SystemClock::new(zone);
    let schedule = cfg.initial_schedule(clock.now())?;

    // ── Hardware ────────────────────────────────────────────────────
    let gpio = &cfg.gpio;
    let valve = SolenoidValve::new(u8::try_from(gpio.valve_pin)?, gpio.relay_active_low)
        .context("failed to set up valve")?;
    let flow = FlowMeter::new(u8::try_from(gpio.flow_pin)?, cfg.device.pulses_per_liter)
        .context("failed to set up flow meter")?;
    let led =
        StatusLed::new(u8::try_from(gpio.status_led_pin)?).context("failed to set up status led")?;
    let mut buttons = panel::spawn_button(u8::try_from(gpio.button_pin)?, cfg.button_classifier())
        .context("failed to set up push button")?;

    let store = FileStore::new(cfg.device.store_path.clone());
    info!(path = %store.path().display(), "schedule store");

    // ── Shared state (ephemeral, for the web UI) ────────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
    shared
        .write()
        .await
        .record_system(format!("controller starting (config {})", config_path.display()));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    let web_port = cfg.device.web_port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web ui stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let topics = Topics::new(&cfg.mqtt.topic_prefix);
    let client_id = cfg.client_id();
    let mut mqttoptions = MqttOptions::new(&client_id, cfg.mqtt.host.clone(), cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    info!(
        client_id = %client_id,
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        "mqtt client created"
    );

    // ── Controller ──────────────────────────────────────────────────
    let ports = Ports {
        clock: Box::new(clock),
        valve: Box::new(valve),
        flow: Box::new(flow),
        status: Box::new(led),
        display: Box::new(ConsoleDisplay::default()),
        notifier: Box::new(MqttNotifier::new(client.clone(), topics.clone())),
        store: Box::new(store),
    };
    let mut ctrl = Controller::new(schedule, ports);
    ctrl.boot();
    sync_state(&shared, &mut ctrl).await;

    let mut tick = interval(Duration::from_millis(cfg.device.tick_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut display_refresh = interval(Duration::from_secs(cfg.device.display_refresh_sec));
    display_refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut link = MqttLink::spawn(eventloop, Duration::from_secs(cfg.mqtt.reconnect_delay_sec));
    let mut buttons_open = true;

    let factory_reset = loop {
        let control = tokio::select! {
            ev = link.recv() => match ev {
                Some(LinkEvent::Up) => {
                    match client.try_subscribe(topics.request.as_str(), QoS::AtLeastOnce) {
                        Ok(()) => info!(topic = %topics.request, "subscribed"),
                        Err(e) => warn!(topic = %topics.request, "subscribe failed: {e}"),
                    }
                    ctrl.link_up();
                    Control::Continue
                }
                Some(LinkEvent::Message(p)) if topics.is_command(&p.topic) => {
                    ctrl.handle_payload(&p.payload)
                }
                Some(LinkEvent::Message(p)) => {
                    debug!(topic = %p.topic, "unhandled topic");
                    Control::Continue
                }
                Some(LinkEvent::Down(detail)) => {
                    ctrl.link_down(&detail);
                    Control::Continue
                }
                None => anyhow::bail!("mqtt link task ended"),
            },
            _ = tick.tick() => {
                ctrl.tick();
                Control::Continue
            }
            _ = display_refresh.tick() => {
                ctrl.refresh_display();
                Control::Continue
            }
            ev = buttons.recv(), if buttons_open => match ev {
                Some(ev) => ctrl.handle_button(ev),
                None => {
                    debug!("button source closed");
                    buttons_open = false;
                    Control::Continue
                }
            },
        };

        sync_state(&shared, &mut ctrl).await;

        if let Control::Restart { factory_reset } = control {
            break factory_reset;
        }
    };

    info!(factory_reset, "restarting");
    link.close(&client, SHUTDOWN_GRACE).await;
    Ok(())
}

/// Copy the controller snapshot and new journal entries into the web state.
async fn sync_state(shared: &SharedState, ctrl: &mut Controller) {
    let events = ctrl.drain_events();
    let status = ctrl.status();
    let mut st = shared.write().await;
    for (kind, detail) in events {
        st.record(kind, detail);
    }
    st.update_controller(status);
}
