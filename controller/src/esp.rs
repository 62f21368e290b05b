use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use carousel_common::{
    config::{NetworkConfig, PinConfig},
    types::parse_command_payload,
    CarouselAction, CarouselEngine, CarouselOutputs, RuntimeConfig, TOPIC_CAROUSEL_STATE,
    TOPIC_CMD_START,
};

use crate::command::submit_command;

const NVS_NAMESPACE: &str = "carousel";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WATCHDOG_FEED_MS: u64 = 1_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type Outputs = CarouselOutputs<
    PinDriver<'static, AnyInputPin, Input>,
    PinDriver<'static, AnyOutputPin, Output>,
    LedcDriver<'static>,
    LedcDriver<'static>,
>;

// LEDC channels are distinct types, one expansion per channel.
macro_rules! attach_pwm {
    ($channel:expr, $timer:expr, $pin:expr) => {{
        let pin: i32 = $pin;
        LedcDriver::new($channel, $timer.clone(), unsafe { AnyOutputPin::new(pin) })
            .with_context(|| format!("failed to attach PWM output on GPIO{pin}"))
    }};
}

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<CarouselEngine>>,
    mqtt_connected: Arc<AtomicBool>,
}

impl SharedState {
    fn engine(&self) -> MutexGuard<'_, CarouselEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, blocking_remote={}",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.carousel.blocking_remote,
    );

    let Peripherals {
        modem, ledc, hledc, ..
    } = Peripherals::take()?;

    let mut engine = CarouselEngine::new(runtime.carousel.clone(), monotonic_ms());
    engine.init_status(monotonic_ms());

    // Servos share one 50 Hz timer on the low-speed block; the light channels
    // run on the high-speed block at their own frequency.
    let servo_timer = Arc::new(
        LedcTimerDriver::new(
            ledc.timer0,
            &TimerConfig::new()
                .frequency(50.Hz().into())
                .resolution(Resolution::Bits14),
        )
        .context("failed to configure servo timer")?,
    );
    let light_timer = Arc::new(
        LedcTimerDriver::new(
            hledc.timer0,
            &TimerConfig::new()
                .frequency(runtime.pins.light_pwm_hz.Hz().into())
                .resolution(Resolution::Bits10),
        )
        .context("failed to configure light timer")?,
    );

    let pins = &runtime.pins;
    let light_servos = [
        attach_pwm!(ledc.channel0, servo_timer, pins.light_servo_pins[0])?,
        attach_pwm!(ledc.channel1, servo_timer, pins.light_servo_pins[1])?,
        attach_pwm!(ledc.channel2, servo_timer, pins.light_servo_pins[2])?,
        attach_pwm!(ledc.channel3, servo_timer, pins.light_servo_pins[3])?,
    ];
    let wheel = attach_pwm!(ledc.channel4, servo_timer, pins.wheel_servo_pin)?;
    let lights = [
        attach_pwm!(hledc.channel0, light_timer, pins.light_pins[0])?,
        attach_pwm!(hledc.channel1, light_timer, pins.light_pins[1])?,
        attach_pwm!(hledc.channel2, light_timer, pins.light_pins[2])?,
        attach_pwm!(hledc.channel3, light_timer, pins.light_pins[3])?,
    ];

    let mut outputs = init_outputs(pins, lights, light_servos, wheel)?;
    execute_actions(&mut outputs, engine.init_hardware());
    info!("carousel hardware initialized");

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    info!("wifi connected");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let shared_state = SharedState {
        engine: Arc::new(Mutex::new(engine)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    subscribe_topics(&mqtt_client)?;
    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn, mqtt_client.clone())?;
    spawn_control_loop(
        shared_state,
        outputs,
        mqtt_client,
        runtime.carousel.loop_interval_ms,
        runtime.carousel.state_publish_interval_ms,
    )?;

    // Keep services and timers alive for the program lifetime.
    let _wifi = wifi;
    let _timers = (servo_timer, light_timer);

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn init_outputs(
    pins: &PinConfig,
    lights: [LedcDriver<'static>; 4],
    light_servos: [LedcDriver<'static>; 4],
    wheel: LedcDriver<'static>,
) -> anyhow::Result<Outputs> {
    let presence = PinDriver::input(unsafe { AnyInputPin::new(pins.pir_pin) })
        .with_context(|| format!("failed to configure PIR input on GPIO{}", pins.pir_pin))?;
    let trigger = PinDriver::output(unsafe { AnyOutputPin::new(pins.music_trigger_pin) })
        .with_context(|| {
            format!(
                "failed to configure music trigger on GPIO{}",
                pins.music_trigger_pin
            )
        })?;

    Ok(CarouselOutputs::new(
        presence,
        pins.presence_active_high,
        trigger,
        lights,
        light_servos,
        wheel,
    ))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        )),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    mqtt.subscribe(TOPIC_CMD_START, QoS::AtMostOnce)?;
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    state.mqtt_connected.store(true, Ordering::Relaxed);

                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }

                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }

                        if let Ok(message) = core::str::from_utf8(data) {
                            handle_mqtt_message(&state, topic, message);
                        }
                    }
                }
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) {
    if topic != TOPIC_CMD_START {
        return;
    }

    let Some(command_id) = parse_command_payload(message) else {
        warn!("ignoring unrecognized command payload {message:?}");
        return;
    };

    if submit_command(&mut state.engine(), command_id, monotonic_ms()) {
        info!("remote command {command_id:#04x} received");
    } else {
        warn!("remote command {command_id:#04x} ignored, carousel busy");
    }
}

fn spawn_control_loop(
    state: SharedState,
    mut outputs: Outputs,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    loop_interval_ms: u64,
    publish_interval_ms: u64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_state_publish_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                let presence = outputs.read_presence().unwrap_or_else(|err| {
                    warn!("PIR read failed: {err}");
                    false
                });

                let (actions, command_error) = {
                    let mut engine = state.engine();
                    let actions = engine.run_cycle(presence, now_ms);
                    (actions, engine.take_command_error())
                };

                if let Some(err) = command_error {
                    warn!("remote command rejected: {err}");
                }
                execute_actions(&mut outputs, actions);

                if now_ms.saturating_sub(last_state_publish_ms) >= publish_interval_ms {
                    last_state_publish_ms = now_ms;
                    if let Err(err) = publish_state(&state, &mqtt) {
                        warn!("state publish failed: {err:#}");
                    }
                }

                thread::sleep(Duration::from_millis(loop_interval_ms));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn publish_state(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return Ok(());
    }

    let payload = serde_json::to_vec(&state.engine().state_payload(monotonic_ms()))?;

    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    client.publish(TOPIC_CAROUSEL_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn execute_actions(outputs: &mut Outputs, actions: Vec<CarouselAction>) {
    for action in actions {
        if let CarouselAction::Delay(ms) = action {
            sleep_feeding_watchdog(ms);
            continue;
        }

        if let Err(err) = outputs.apply(action) {
            warn!("carousel action failed [{action:?}]: {err}");
        }
    }
}

// Blocking remote commands wait far longer than the watchdog period.
fn sleep_feeding_watchdog(ms: u64) {
    let mut remaining = ms;
    while remaining > 0 {
        let chunk = remaining.min(WATCHDOG_FEED_MS);
        thread::sleep(Duration::from_millis(chunk));
        feed_watchdog();
        remaining -= chunk;
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(RuntimeConfig::from_json(value.as_bytes())?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
