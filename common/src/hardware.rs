//! Maps engine actions onto embedded-hal outputs.
//!
//! Servo channels expect a 50 Hz PWM whose pulse width encodes the angle
//! (500-2500 us over 0-180 degrees). The wheel is a continuous-rotation
//! servo on the same encoding, so 90 degrees is its stop point.

use embedded_hal::{
    digital::{self, InputPin, OutputPin},
    pwm::{self, SetDutyCycle},
};
use thiserror::Error;

use crate::{
    carousel::{CarouselAction, LIGHT_SERVO_COUNT},
    config::SERVO_MAX_ANGLE,
};

pub const LIGHT_CHANNELS: usize = 4;
pub const SERVO_FREQUENCY_HZ: u32 = 50;
pub const SERVO_PERIOD_US: u32 = 1_000_000 / SERVO_FREQUENCY_HZ;
pub const SERVO_MIN_PULSE_US: u32 = 500;
pub const SERVO_MAX_PULSE_US: u32 = 2_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("pwm output failed: {0:?}")]
    Pwm(pwm::ErrorKind),
    #[error("gpio access failed: {0:?}")]
    Gpio(digital::ErrorKind),
    #[error("no light servo at index {0}")]
    ServoIndex(usize),
}

fn pwm_error<E: pwm::Error>(err: E) -> HardwareError {
    HardwareError::Pwm(err.kind())
}

fn gpio_error<E: digital::Error>(err: E) -> HardwareError {
    HardwareError::Gpio(err.kind())
}

/// Duty cycle for a servo angle, given the channel's full-scale duty.
pub fn servo_duty(degrees: u8, max_duty: u16) -> u16 {
    let degrees = u32::from(degrees.min(SERVO_MAX_ANGLE));
    let pulse_us = SERVO_MIN_PULSE_US
        + (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US) * degrees / u32::from(SERVO_MAX_ANGLE);
    (u32::from(max_duty) * pulse_us / SERVO_PERIOD_US) as u16
}

pub struct ServoOutput<P> {
    pwm: P,
}

impl<P: SetDutyCycle> ServoOutput<P> {
    pub fn new(pwm: P) -> Self {
        Self { pwm }
    }

    pub fn write(&mut self, degrees: u8) -> Result<(), HardwareError> {
        let duty = servo_duty(degrees, self.pwm.max_duty_cycle());
        self.pwm.set_duty_cycle(duty).map_err(pwm_error)
    }
}

/// Physical outputs of one carousel: presence input, audio trigger line,
/// ambient light PWM channels, light servos and the wheel servo.
pub struct CarouselOutputs<I, T, L, S> {
    presence: I,
    presence_active_high: bool,
    trigger: T,
    lights: [L; LIGHT_CHANNELS],
    light_servos: [ServoOutput<S>; LIGHT_SERVO_COUNT],
    wheel: ServoOutput<S>,
}

impl<I, T, L, S> CarouselOutputs<I, T, L, S>
where
    I: InputPin,
    T: OutputPin,
    L: SetDutyCycle,
    S: SetDutyCycle,
{
    pub fn new(
        presence: I,
        presence_active_high: bool,
        trigger: T,
        lights: [L; LIGHT_CHANNELS],
        light_servos: [S; LIGHT_SERVO_COUNT],
        wheel: S,
    ) -> Self {
        Self {
            presence,
            presence_active_high,
            trigger,
            lights,
            light_servos: light_servos.map(ServoOutput::new),
            wheel: ServoOutput::new(wheel),
        }
    }

    pub fn read_presence(&mut self) -> Result<bool, HardwareError> {
        let high = self.presence.is_high().map_err(gpio_error)?;
        Ok(high == self.presence_active_high)
    }

    pub fn apply(&mut self, action: CarouselAction) -> Result<(), HardwareError> {
        match action {
            CarouselAction::SetWheel(set_point) => self.wheel.write(set_point),
            CarouselAction::SetLights(intensity) => {
                for light in &mut self.lights {
                    light
                        .set_duty_cycle_fraction(u16::from(intensity), u16::from(u8::MAX))
                        .map_err(pwm_error)?;
                }
                Ok(())
            }
            CarouselAction::SetLightServo { index, angle } => self
                .light_servos
                .get_mut(index)
                .ok_or(HardwareError::ServoIndex(index))?
                .write(angle),
            CarouselAction::Trigger(level) => {
                let result = if level.is_high() {
                    self.trigger.set_high()
                } else {
                    self.trigger.set_low()
                };
                result.map_err(gpio_error)
            }
            // Waits are paced by the caller.
            CarouselAction::Delay(_) => Ok(()),
        }
    }
}
