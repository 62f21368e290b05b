use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use carousel_common::{
    carousel::LIGHT_SERVO_COUNT,
    types::{parse_command_payload, parse_presence_payload},
    CarouselAction, CarouselEngine, CarouselStatePayload, RuntimeConfig, TriggerLevel,
    TOPIC_CAROUSEL_STATE, TOPIC_CMD_START, TOPIC_SIM_PRESENCE,
};

use crate::command::submit_command;

const MAX_MQTT_PAYLOAD_BYTES: usize = 64;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<CarouselEngine>>,
    outputs: Arc<Mutex<SimulatedOutputs>>,
    presence: Arc<AtomicBool>,
    mqtt: AsyncClient,
}

/// In-memory stand-in for the actuators. Writes are traced and the last
/// value per channel is kept for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct SimulatedOutputs {
    wheel: u8,
    lights: u8,
    #[serde(rename = "lightServos")]
    light_servos: [u8; LIGHT_SERVO_COUNT],
    trigger: TriggerLevel,
    writes: u64,
}

impl Default for SimulatedOutputs {
    fn default() -> Self {
        Self {
            wheel: 0,
            lights: 0,
            light_servos: [0; LIGHT_SERVO_COUNT],
            trigger: TriggerLevel::Inactive,
            writes: 0,
        }
    }
}

impl SimulatedOutputs {
    fn apply(&mut self, action: CarouselAction) {
        match action {
            CarouselAction::SetWheel(set_point) => {
                info!("wheel set-point {set_point}");
                self.wheel = set_point;
            }
            CarouselAction::SetLights(intensity) => {
                info!("lights intensity {intensity}");
                self.lights = intensity;
            }
            CarouselAction::SetLightServo { index, angle } => {
                debug!("light servo {index} -> {angle}");
                match self.light_servos.get_mut(index) {
                    Some(slot) => *slot = angle,
                    None => {
                        warn!("no light servo at index {index}");
                        return;
                    }
                }
            }
            CarouselAction::Trigger(level) => {
                if level != self.trigger {
                    info!("music trigger {level:?}");
                }
                self.trigger = level;
            }
            CarouselAction::Delay(_) => return,
        }
        self.writes += 1;
    }
}

#[derive(Debug, Serialize)]
struct StatusView {
    carousel: CarouselStatePayload,
    outputs: SimulatedOutputs,
    presence: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    #[serde(rename = "commandId")]
    command_id: i32,
}

#[derive(Debug, Serialize)]
struct PresenceView {
    presence: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config(&runtime_config_path())
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}");
            RuntimeConfig::default()
        });

    let mut engine = CarouselEngine::new(runtime.carousel.clone(), monotonic_ms());
    engine.init_status(monotonic_ms());
    let mut outputs = SimulatedOutputs::default();
    for action in engine.init_hardware() {
        outputs.apply(action);
    }

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new(
        runtime.network.mqtt_client_id.clone(),
        mqtt_host,
        mqtt_port,
    );
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        outputs: Arc::new(Mutex::new(outputs)),
        presence: Arc::new(AtomicBool::new(false)),
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), runtime.carousel.loop_interval_ms);
    spawn_state_publish_loop(
        app_state.clone(),
        runtime.carousel.state_publish_interval_ms,
    );

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/command", post(handle_post_command))
        .route("/api/presence", post(handle_post_presence))
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Leave the carousel idle: wheel stopped, lights low, trigger released.
    let actions = {
        let mut engine = app_state.engine.lock().await;
        let mut actions = engine.mqtt_end_carousel();
        actions.extend(engine.update_hardware(monotonic_ms()));
        actions
    };
    execute_actions(&app_state.outputs, actions).await;
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_CMD_START, TOPIC_SIM_PRESENCE] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, loop_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(loop_interval_ms));
        // A blocking remote command can hold the loop for seconds; do not
        // replay the missed ticks afterwards.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();
            let presence = app_state.presence.load(Ordering::Relaxed);

            let (actions, command_error) = {
                let mut engine = app_state.engine.lock().await;
                let actions = engine.run_cycle(presence, now_ms);
                (actions, engine.take_command_error())
            };

            if let Some(err) = command_error {
                warn!("remote command rejected: {err}");
            }
            if !actions.is_empty() {
                execute_actions(&app_state.outputs, actions).await;
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, publish_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(publish_interval_ms));
        loop {
            interval.tick().await;

            let now_ms = monotonic_ms();
            let payload = {
                let engine = app_state.engine.lock().await;
                serde_json::to_vec(&engine.state_payload(now_ms))
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CAROUSEL_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("carousel state publish failed: {err}");
                    }
                }
                Err(err) => warn!("carousel state serialization failed: {err}"),
            }
        }
    });
}

// The engine lock is never held across a wait, so MQTT and HTTP stay
// serviced while a blocking command sleeps.
async fn execute_actions(outputs: &Mutex<SimulatedOutputs>, actions: Vec<CarouselAction>) {
    for action in actions {
        if let CarouselAction::Delay(ms) = action {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            continue;
        }
        outputs.lock().await.apply(action);
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;

    match topic {
        TOPIC_CMD_START => {
            let Some(command_id) = parse_command_payload(message) else {
                warn!("ignoring unrecognized command payload {message:?}");
                return Ok(());
            };
            let accepted = {
                let mut engine = app_state.engine.lock().await;
                submit_command(&mut engine, command_id, monotonic_ms())
            };
            if accepted {
                info!("remote command {command_id:#04x} received");
            } else {
                warn!("remote command {command_id:#04x} ignored, carousel busy");
            }
        }
        TOPIC_SIM_PRESENCE => match parse_presence_payload(message) {
            Some(presence) => app_state.presence.store(presence, Ordering::Relaxed),
            None => warn!("ignoring presence payload {message:?}"),
        },
        _ => {}
    }

    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now_ms = monotonic_ms();
    let carousel = state.engine.lock().await.state_payload(now_ms);
    let outputs = state.outputs.lock().await.clone();

    Json(StatusView {
        carousel,
        outputs,
        presence: state.presence.load(Ordering::Relaxed),
    })
}

async fn handle_post_command(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(command_id) = parse_command_payload(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid command value");
    };

    let accepted = {
        let mut engine = state.engine.lock().await;
        submit_command(&mut engine, command_id, monotonic_ms())
    };
    if !accepted {
        return error_response(StatusCode::CONFLICT, "Carousel is busy with a remote command");
    }

    info!("remote command {command_id:#04x} received over http");
    (StatusCode::ACCEPTED, Json(CommandAccepted { command_id })).into_response()
}

async fn handle_post_presence(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(presence) = parse_presence_payload(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Presence must be on or off");
    };

    state.presence.store(presence, Ordering::Relaxed);
    Json(PresenceView { presence }).into_response()
}

fn runtime_config_path() -> PathBuf {
    std::env::var("CAROUSEL_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.carousel"))
        .join("runtime.json")
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => RuntimeConfig::from_json(&raw)
            .with_context(|| format!("invalid runtime config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
