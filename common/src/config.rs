use serde::{Deserialize, Serialize};

pub const SERVO_MAX_ANGLE: u8 = 180;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CarouselConfig {
    /// Continuous-rotation servo set-point while the carousel runs.
    pub wheel_carousel: u8,
    /// Continuous-rotation servo set-point that holds the wheel still.
    pub wheel_stop: u8,
    pub min_angle: u8,
    pub max_angle: u8,
    pub low_light: u8,
    pub high_light: u8,
    /// Delay between two one-degree steps of the light servos.
    pub servo_cycle_ms: u64,
    /// Duration of one track in the music demo.
    pub music_timeout_ms: u64,
    pub music_play_songs: u8,
    pub lights_timeout_ms: u64,
    /// Released-trigger time the player needs before the next pulse.
    pub trigger_settle_ms: u64,
    /// Run remote demos to completion inside a single loop iteration.
    pub blocking_remote: bool,
    pub loop_interval_ms: u64,
    pub state_publish_interval_ms: u64,
}

impl Default for CarouselConfig {
    fn default() -> Self {
        Self {
            wheel_carousel: 110,
            wheel_stop: 90,
            min_angle: 10,
            max_angle: 90,
            low_light: 5,
            high_light: 200,
            servo_cycle_ms: 25,
            music_timeout_ms: 5_000,
            music_play_songs: 5,
            lights_timeout_ms: 10_000,
            trigger_settle_ms: 25,
            blocking_remote: false,
            loop_interval_ms: 5,
            state_publish_interval_ms: 10_000,
        }
    }
}

impl CarouselConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.wheel_carousel = self.wheel_carousel.min(SERVO_MAX_ANGLE);
        self.wheel_stop = self.wheel_stop.min(SERVO_MAX_ANGLE);

        // A sweep needs room to clamp one degree inside each bound.
        self.max_angle = self.max_angle.min(SERVO_MAX_ANGLE);
        if self.max_angle < 3 || self.min_angle > self.max_angle - 3 {
            self.min_angle = defaults.min_angle;
            self.max_angle = defaults.max_angle;
        }

        if self.low_light > self.high_light {
            std::mem::swap(&mut self.low_light, &mut self.high_light);
        }

        self.servo_cycle_ms = self.servo_cycle_ms.max(1);
        self.loop_interval_ms = self.loop_interval_ms.clamp(1, 1_000);
        self.state_publish_interval_ms = self.state_publish_interval_ms.max(1_000);
    }

    /// Total wall time a remote command keeps the carousel busy.
    pub fn music_duration_ms(&self) -> u64 {
        u64::from(self.music_play_songs)
            .saturating_mul(self.music_timeout_ms.saturating_add(self.trigger_settle_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PinConfig {
    pub light_servo_pins: [i32; 4],
    pub wheel_servo_pin: i32,
    pub light_pins: [i32; 4],
    pub music_trigger_pin: i32,
    pub pir_pin: i32,
    /// Input level reported by the sensor while a presence is detected.
    pub presence_active_high: bool,
    pub light_pwm_hz: u32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            light_servo_pins: [13, 14, 27, 26],
            wheel_servo_pin: 25,
            light_pins: [16, 17, 18, 19],
            music_trigger_pin: 23,
            pir_pin: 32,
            presence_active_high: true,
            light_pwm_hz: 1_000,
        }
    }
}

impl PinConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for (pin, default) in self
            .light_servo_pins
            .iter_mut()
            .zip(defaults.light_servo_pins)
        {
            if *pin < 0 {
                *pin = default;
            }
        }
        for (pin, default) in self.light_pins.iter_mut().zip(defaults.light_pins) {
            if *pin < 0 {
                *pin = default;
            }
        }
        if self.wheel_servo_pin < 0 {
            self.wheel_servo_pin = defaults.wheel_servo_pin;
        }
        if self.music_trigger_pin < 0 {
            self.music_trigger_pin = defaults.music_trigger_pin;
        }
        if self.pir_pin < 0 {
            self.pir_pin = defaults.pir_pin;
        }
        self.light_pwm_hz = self.light_pwm_hz.clamp(100, 40_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: "carousel-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub carousel: CarouselConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        let mut runtime: Self = serde_json::from_slice(raw)?;
        runtime.sanitize();
        Ok(runtime)
    }

    pub fn sanitize(&mut self) {
        self.carousel.sanitize();
        self.pins.sanitize();
        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = NetworkConfig::default().mqtt_port;
        }
        if self.network.mqtt_client_id.trim().is_empty() {
            self.network.mqtt_client_id = NetworkConfig::default().mqtt_client_id;
        }
    }
}
