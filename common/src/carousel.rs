use thiserror::Error;

use crate::{
    config::CarouselConfig,
    remote::RemoteRun,
    types::{CarouselStatePayload, RemoteCommand, Rotation, TriggerLevel},
};

pub const LIGHT_SERVO_COUNT: usize = 4;

// Light servo indices. Pair A drives LIGHT1/LIGHT3, pair B drives LIGHT2/LIGHT4.
pub const LIGHT1: usize = 0;
pub const LIGHT2: usize = 1;
pub const LIGHT3: usize = 2;
pub const LIGHT4: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarouselAction {
    /// Continuous-rotation servo set-point.
    SetWheel(u8),
    /// PWM intensity applied to every ambient light channel.
    SetLights(u8),
    SetLightServo { index: usize, angle: u8 },
    Trigger(TriggerLevel),
    Delay(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown remote command id {0:#04x}")]
    Unknown(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus {
    pub pir: bool,
    pub mqtt: bool,
    pub mqtt_command: i32,
    pub wheel: u8,
    pub is_rotating: bool,
    pub light: u8,
    pub servo_pos: [u8; LIGHT_SERVO_COUNT],
    pub rotation_dir_a: Rotation,
    pub rotation_dir_b: Rotation,
    pub timer_start_ms: u64,
    pub timer_servo_ms: u64,
}

impl MachineStatus {
    /// Boot defaults: the two pairs start at opposite ends of the sweep and
    /// move towards each other, so the colors cross as soon as they run.
    pub fn boot(config: &CarouselConfig, now_ms: u64) -> Self {
        let mut servo_pos = [0; LIGHT_SERVO_COUNT];
        servo_pos[LIGHT1] = config.min_angle;
        servo_pos[LIGHT3] = config.min_angle;
        servo_pos[LIGHT2] = config.max_angle;
        servo_pos[LIGHT4] = config.max_angle;

        Self {
            pir: false,
            mqtt: false,
            mqtt_command: 0,
            wheel: config.wheel_stop,
            is_rotating: false,
            light: config.low_light,
            servo_pos,
            rotation_dir_a: Rotation::Clockwise,
            rotation_dir_b: Rotation::Counterclockwise,
            timer_start_ms: now_ms,
            timer_servo_ms: now_ms,
        }
    }
}

/// Owns the machine status and turns sensor samples, timers and remote
/// commands into actuator writes.
///
/// Every operation returns the actions the caller has to apply, in order.
/// `Delay` entries are waits the caller must honor before the next action.
#[derive(Debug, Clone)]
pub struct CarouselEngine {
    config: CarouselConfig,
    status: MachineStatus,
    remote: Option<RemoteRun>,
    /// End of the wait window of the last blocking command.
    blocking_until_ms: u64,
    /// Set-points must be rewritten because a run was dropped mid-plan.
    resync_outputs: bool,
    rejected_commands: u64,
    last_command_error: Option<CommandError>,
}

impl CarouselEngine {
    pub fn new(mut config: CarouselConfig, now_ms: u64) -> Self {
        config.sanitize();
        let status = MachineStatus::boot(&config, now_ms);
        Self {
            config,
            status,
            remote: None,
            blocking_until_ms: 0,
            resync_outputs: false,
            rejected_commands: 0,
            last_command_error: None,
        }
    }

    pub fn config(&self) -> &CarouselConfig {
        &self.config
    }

    pub fn status(&self) -> &MachineStatus {
        &self.status
    }

    pub fn init_status(&mut self, now_ms: u64) {
        self.status = MachineStatus::boot(&self.config, now_ms);
        self.remote = None;
        self.blocking_until_ms = 0;
        self.resync_outputs = false;
    }

    pub fn init_hardware(&self) -> Vec<CarouselAction> {
        let mut actions = vec![CarouselAction::SetLights(self.config.low_light)];
        actions.extend(
            self.status
                .servo_pos
                .iter()
                .enumerate()
                .map(|(index, &angle)| CarouselAction::SetLightServo { index, angle }),
        );
        actions.push(CarouselAction::SetWheel(self.config.wheel_stop));
        actions.push(CarouselAction::Trigger(TriggerLevel::Inactive));
        actions
    }

    /// One control loop iteration: presence, remote command, then outputs.
    pub fn run_cycle(&mut self, presence: bool, now_ms: u64) -> Vec<CarouselAction> {
        let mut actions = self.check_pir_status(presence, now_ms);
        actions.extend(self.mqtt_check_status(now_ms));
        actions.extend(self.update_hardware(now_ms));
        actions
    }

    pub fn check_pir_status(&mut self, presence: bool, now_ms: u64) -> Vec<CarouselAction> {
        // A remote command inhibits the sensor until its sequence completes.
        if self.status.mqtt {
            return Vec::new();
        }

        if !presence {
            return self.end_carousel();
        }

        let mut actions = Vec::new();
        if !self.status.pir {
            actions.push(CarouselAction::Trigger(TriggerLevel::Active));
        }
        self.set_light(self.config.high_light);
        self.set_wheel_speed(self.config.wheel_carousel);
        self.status.timer_start_ms = now_ms;
        self.set_pir(true);
        actions
    }

    /// Idle teardown shared by presence loss and remote commands. Safe to
    /// call every tick.
    pub fn end_carousel(&mut self) -> Vec<CarouselAction> {
        self.set_pir(false);
        self.set_light(self.config.low_light);
        self.set_wheel_speed(self.config.wheel_stop);
        vec![CarouselAction::Trigger(TriggerLevel::Inactive)]
    }

    pub fn mqtt_check_status(&mut self, now_ms: u64) -> Vec<CarouselAction> {
        if !self.status.mqtt {
            return Vec::new();
        }
        if self.remote.is_some() {
            return self.advance_remote(now_ms);
        }

        let mut actions = self.end_carousel();
        self.sync_wheel_and_lights(&mut actions);

        if self.config.blocking_remote {
            actions.extend(self.mqtt_exec_command(now_ms));
        } else {
            actions.extend(self.start_remote(now_ms));
        }
        actions
    }

    /// Runs the pending command to completion: the returned plan contains
    /// every wait of the routine, followed by the idle teardown.
    pub fn mqtt_exec_command(&mut self, now_ms: u64) -> Vec<CarouselAction> {
        self.remote = None;
        self.status.timer_start_ms = now_ms;

        let mut actions = match self.pending_command() {
            Some(command) => {
                self.blocking_until_ms = now_ms.saturating_add(command.duration_ms(&self.config));
                command.plan(&self.config)
            }
            None => Vec::new(),
        };
        self.track_set_points(&actions);
        actions.extend(self.mqtt_end_carousel());
        actions
    }

    pub fn mqtt_end_carousel(&mut self) -> Vec<CarouselAction> {
        self.mqtt_set_mqtt(false);
        self.end_carousel()
    }

    pub fn mqtt_set_command(&mut self, command_id: i32) {
        self.status.mqtt_command = command_id;
    }

    pub fn mqtt_set_mqtt(&mut self, enabled: bool) {
        self.status.mqtt = enabled;
        if !enabled && self.remote.take().is_some() {
            self.resync_outputs = true;
        }
    }

    pub fn update_hardware(&mut self, now_ms: u64) -> Vec<CarouselAction> {
        let mut actions = Vec::new();
        self.sync_wheel_and_lights(&mut actions);

        if self.status.pir {
            self.servo_light_time_to_move(now_ms, &mut actions);
        }
        actions
    }

    /// Moves both oscillation pairs one degree and writes all four servos.
    pub fn step_light_servo(&mut self) -> Vec<CarouselAction> {
        let (min, max) = (self.config.min_angle, self.config.max_angle);
        let positions = &mut self.status.servo_pos;

        self.status.rotation_dir_a =
            step_pair(positions, LIGHT1, LIGHT3, self.status.rotation_dir_a, min, max);
        self.status.rotation_dir_b =
            step_pair(positions, LIGHT2, LIGHT4, self.status.rotation_dir_b, min, max);

        [LIGHT1, LIGHT3, LIGHT2, LIGHT4]
            .into_iter()
            .map(|index| CarouselAction::SetLightServo {
                index,
                angle: self.status.servo_pos[index],
            })
            .collect()
    }

    pub fn is_pir(&self) -> bool {
        self.status.pir
    }

    pub fn mqtt_is_mqtt(&self) -> bool {
        self.status.mqtt
    }

    pub fn wheel(&self) -> u8 {
        self.status.wheel
    }

    pub fn light(&self) -> u8 {
        self.status.light
    }

    pub fn set_pir(&mut self, active: bool) {
        self.status.pir = active;
    }

    pub fn set_wheel_speed(&mut self, set_point: u8) {
        self.status.wheel = set_point;
    }

    pub fn set_light(&mut self, intensity: u8) {
        self.status.light = intensity;
    }

    /// Whole seconds since presence (or a remote command) was last asserted.
    pub fn elapsed_secs(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.status.timer_start_ms) / 1_000
    }

    pub fn is_remote_busy(&self) -> bool {
        self.remote.is_some()
    }

    /// Whether a new remote command may be latched: none is pending, none is
    /// stepping, and the waits of a blocking command have elapsed.
    pub fn accepts_command(&self, now_ms: u64) -> bool {
        !self.status.mqtt && self.remote.is_none() && now_ms >= self.blocking_until_ms
    }

    pub fn remote_command(&self) -> Option<RemoteCommand> {
        self.remote.as_ref().map(RemoteRun::command)
    }

    pub fn rejected_commands(&self) -> u64 {
        self.rejected_commands
    }

    pub fn take_command_error(&mut self) -> Option<CommandError> {
        self.last_command_error.take()
    }

    pub fn state_payload(&self, now_ms: u64) -> CarouselStatePayload {
        CarouselStatePayload {
            pir: self.status.pir,
            mqtt: self.status.mqtt,
            mqtt_command: self.status.mqtt_command,
            wheel: self.status.wheel,
            is_rotating: self.status.is_rotating,
            light: self.status.light,
            servo_pos: self.status.servo_pos,
            rotation_dir_a: self.status.rotation_dir_a.as_str(),
            rotation_dir_b: self.status.rotation_dir_b.as_str(),
            elapsed_sec: self.elapsed_secs(now_ms),
            remote_busy: !self.accepts_command(now_ms),
            remote_command: self.remote_command().map(RemoteCommand::as_str),
            rejected_commands: self.rejected_commands,
        }
    }

    fn start_remote(&mut self, now_ms: u64) -> Vec<CarouselAction> {
        self.status.timer_start_ms = now_ms;
        match self.pending_command() {
            Some(command) => {
                self.remote = Some(RemoteRun::new(command, &self.config));
                self.advance_remote(now_ms)
            }
            None => self.mqtt_end_carousel(),
        }
    }

    fn advance_remote(&mut self, now_ms: u64) -> Vec<CarouselAction> {
        let Some(run) = self.remote.as_mut() else {
            return Vec::new();
        };
        let mut actions = run.advance(now_ms);
        let finished = run.is_finished();

        self.track_set_points(&actions);
        if finished {
            self.remote = None;
            actions.extend(self.mqtt_end_carousel());
        }
        actions
    }

    // Unknown identifiers produce no actuation; the rejection is kept for the
    // caller to report.
    fn pending_command(&mut self) -> Option<RemoteCommand> {
        let id = self.status.mqtt_command;
        let command = RemoteCommand::from_id(id);
        if command.is_none() {
            self.rejected_commands = self.rejected_commands.saturating_add(1);
            self.last_command_error = Some(CommandError::Unknown(id));
        }
        command
    }

    fn track_set_points(&mut self, actions: &[CarouselAction]) {
        for action in actions {
            match *action {
                CarouselAction::SetLights(intensity) => self.status.light = intensity,
                CarouselAction::SetWheel(set_point) => self.status.wheel = set_point,
                _ => {}
            }
        }
    }

    fn sync_wheel_and_lights(&mut self, actions: &mut Vec<CarouselAction>) {
        if self.status.pir == self.status.is_rotating && !self.resync_outputs {
            return;
        }
        self.resync_outputs = false;
        self.status.is_rotating = self.status.pir;
        actions.push(CarouselAction::SetWheel(self.status.wheel));
        actions.push(CarouselAction::SetLights(self.status.light));
    }

    fn servo_light_time_to_move(&mut self, now_ms: u64, actions: &mut Vec<CarouselAction>) {
        if now_ms.saturating_sub(self.status.timer_servo_ms) >= self.config.servo_cycle_ms {
            actions.extend(self.step_light_servo());
            self.status.timer_servo_ms = now_ms;
        }
    }
}

fn step_pair(
    positions: &mut [u8; LIGHT_SERVO_COUNT],
    first: usize,
    second: usize,
    direction: Rotation,
    min: u8,
    max: u8,
) -> Rotation {
    let next = i16::from(positions[first]) + direction.increment();
    let (angle, direction) = if next >= i16::from(max) {
        (max - 1, Rotation::Counterclockwise)
    } else if next <= i16::from(min) {
        (min + 1, Rotation::Clockwise)
    } else {
        (next as u8, direction)
    };

    positions[first] = angle;
    positions[second] = angle;
    direction
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn engine() -> CarouselEngine {
        CarouselEngine::new(CarouselConfig::default(), 0)
    }

    fn blocking_engine() -> CarouselEngine {
        let config = CarouselConfig {
            blocking_remote: true,
            ..CarouselConfig::default()
        };
        CarouselEngine::new(config, 0)
    }

    fn waits(actions: &[CarouselAction]) -> u64 {
        actions
            .iter()
            .map(|action| match action {
                CarouselAction::Delay(ms) => *ms,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn boot_defaults() {
        let mut engine = engine();
        engine.set_pir(true);
        engine.set_light(99);
        engine.init_status(1_234);

        let status = engine.status();
        assert!(!status.pir);
        assert!(!status.mqtt);
        assert_eq!(status.wheel, 90);
        assert_eq!(status.light, 5);
        assert_eq!(status.servo_pos, [10, 90, 10, 90]);
        assert_eq!(status.rotation_dir_a, Rotation::Clockwise);
        assert_eq!(status.rotation_dir_b, Rotation::Counterclockwise);
        assert_eq!(status.timer_start_ms, 1_234);
        assert_eq!(status.timer_servo_ms, 1_234);
    }

    #[test]
    fn init_hardware_drives_boot_defaults() {
        let engine = engine();

        assert_eq!(
            engine.init_hardware(),
            vec![
                CarouselAction::SetLights(5),
                CarouselAction::SetLightServo { index: 0, angle: 10 },
                CarouselAction::SetLightServo { index: 1, angle: 90 },
                CarouselAction::SetLightServo { index: 2, angle: 10 },
                CarouselAction::SetLightServo { index: 3, angle: 90 },
                CarouselAction::SetWheel(90),
                CarouselAction::Trigger(TriggerLevel::Inactive),
            ]
        );
    }

    #[test]
    fn presence_starts_the_carousel() {
        let mut engine = engine();
        let actions = engine.check_pir_status(true, 500);

        assert_eq!(actions, vec![CarouselAction::Trigger(TriggerLevel::Active)]);
        assert!(engine.is_pir());
        assert_eq!(engine.light(), 200);
        assert_eq!(engine.wheel(), 110);
        assert_eq!(engine.status().timer_start_ms, 500);
    }

    #[test]
    fn continued_presence_restamps_without_retriggering() {
        let mut engine = engine();
        let _ = engine.check_pir_status(true, 500);
        let actions = engine.check_pir_status(true, 3_700);

        assert!(actions.is_empty());
        assert_eq!(engine.elapsed_secs(4_700), 1);
    }

    #[test]
    fn absence_tears_down() {
        let mut engine = engine();
        let _ = engine.check_pir_status(true, 500);
        let actions = engine.check_pir_status(false, 600);

        assert_eq!(
            actions,
            vec![CarouselAction::Trigger(TriggerLevel::Inactive)]
        );
        assert!(!engine.is_pir());
        assert_eq!(engine.light(), 5);
        assert_eq!(engine.wheel(), 90);
    }

    #[test]
    fn end_carousel_is_idempotent() {
        let mut engine = engine();
        let _ = engine.check_pir_status(true, 0);
        let _ = engine.update_hardware(0);

        let first = engine.end_carousel();
        let after_first = engine.status().clone();
        let second = engine.end_carousel();

        assert_eq!(first, second);
        assert_eq!(engine.status(), &after_first);
    }

    #[test]
    fn update_hardware_writes_only_on_edges() {
        let mut engine = engine();
        let _ = engine.check_pir_status(true, 0);

        let start = engine.update_hardware(0);
        assert_eq!(
            start,
            vec![
                CarouselAction::SetWheel(110),
                CarouselAction::SetLights(200)
            ]
        );
        assert!(engine.status().is_rotating);
        assert!(engine.update_hardware(1).is_empty());

        let _ = engine.check_pir_status(false, 2);
        let stop = engine.update_hardware(2);
        assert_eq!(
            stop,
            vec![CarouselAction::SetWheel(90), CarouselAction::SetLights(5)]
        );
        assert!(!engine.status().is_rotating);
        assert!(engine.update_hardware(3).is_empty());
    }

    #[test]
    fn oscillation_steps_once_per_period() {
        let mut engine = engine();
        let _ = engine.check_pir_status(true, 0);
        let _ = engine.update_hardware(0);

        let actions = engine.update_hardware(25);
        assert_eq!(engine.status().servo_pos, [11, 89, 11, 89]);
        assert_eq!(
            actions,
            vec![
                CarouselAction::SetLightServo { index: 0, angle: 11 },
                CarouselAction::SetLightServo { index: 2, angle: 11 },
                CarouselAction::SetLightServo { index: 1, angle: 89 },
                CarouselAction::SetLightServo { index: 3, angle: 89 },
            ]
        );
        assert_eq!(engine.status().timer_servo_ms, 25);

        // Faster loop ticks do not speed up the sweep.
        for now in 26..50 {
            assert!(engine.update_hardware(now).is_empty());
        }
        assert_eq!(engine.status().servo_pos, [11, 89, 11, 89]);
    }

    #[test]
    fn oscillation_is_idle_without_presence() {
        let mut engine = engine();
        assert!(engine.update_hardware(10_000).is_empty());
        assert_eq!(engine.status().servo_pos, [10, 90, 10, 90]);
    }

    #[test]
    fn sweep_reverses_at_bounds() {
        let mut engine = engine();
        engine.status.servo_pos = [88, 12, 88, 12];

        let _ = engine.step_light_servo();
        assert_eq!(engine.status().servo_pos, [89, 11, 89, 11]);

        let _ = engine.step_light_servo();
        assert_eq!(engine.status().servo_pos, [89, 11, 89, 11]);
        assert_eq!(engine.status().rotation_dir_a, Rotation::Counterclockwise);
        assert_eq!(engine.status().rotation_dir_b, Rotation::Clockwise);

        let _ = engine.step_light_servo();
        assert_eq!(engine.status().servo_pos, [88, 12, 88, 12]);
    }

    #[test]
    fn remote_flag_preempts_presence() {
        let mut engine = engine();
        let _ = engine.check_pir_status(true, 0);
        let _ = engine.update_hardware(0);

        engine.mqtt_set_command(RemoteCommand::LIGHTS_ID);
        engine.mqtt_set_mqtt(true);
        let actions = engine.mqtt_check_status(100);

        assert!(!engine.is_pir());
        assert!(!engine.status().is_rotating);
        assert_eq!(
            &actions[..3],
            &[
                CarouselAction::Trigger(TriggerLevel::Inactive),
                CarouselAction::SetWheel(90),
                CarouselAction::SetLights(5),
            ]
        );
        assert_eq!(actions.last(), Some(&CarouselAction::SetLights(200)));
    }

    #[test]
    fn presence_is_ignored_while_remote_runs() {
        let mut engine = engine();
        engine.mqtt_set_command(RemoteCommand::MUSIC_ID);
        engine.mqtt_set_mqtt(true);
        let _ = engine.run_cycle(false, 0);

        let actions = engine.check_pir_status(true, 100);
        assert!(actions.is_empty());
        assert!(!engine.is_pir());
        assert!(engine.is_remote_busy());
    }

    #[test]
    fn blocking_run_returns_to_idle() {
        let mut engine = blocking_engine();
        let _ = engine.check_pir_status(true, 0);
        engine.mqtt_set_command(RemoteCommand::RUN_ID);
        engine.mqtt_set_mqtt(true);

        let actions = engine.mqtt_exec_command(0);

        assert!(!engine.mqtt_is_mqtt());
        assert!(!engine.is_pir());
        assert_eq!(engine.light(), 5);
        assert_eq!(engine.wheel(), 90);
        assert_eq!(waits(&actions), 5 * (5_000 + 25));
        assert_eq!(
            actions.last(),
            Some(&CarouselAction::Trigger(TriggerLevel::Inactive))
        );
        assert!(!engine.is_remote_busy());
    }

    #[test]
    fn blocking_check_runs_whole_plan_in_one_call() {
        let mut engine = blocking_engine();
        engine.mqtt_set_command(RemoteCommand::LIGHTS_ID);
        engine.mqtt_set_mqtt(true);

        let actions = engine.mqtt_check_status(0);

        assert_eq!(waits(&actions), 10_000);
        assert!(!engine.mqtt_is_mqtt());
        assert!(engine.mqtt_check_status(1).is_empty());
    }

    #[test]
    fn stepped_lights_run_across_ticks() {
        let mut engine = engine();
        engine.mqtt_set_command(RemoteCommand::LIGHTS_ID);
        engine.mqtt_set_mqtt(true);

        let _ = engine.run_cycle(false, 1_000);
        assert!(engine.mqtt_is_mqtt());
        assert_eq!(engine.light(), 200);
        assert_eq!(engine.remote_command(), Some(RemoteCommand::Lights));
        assert_eq!(engine.elapsed_secs(3_000), 2);

        assert!(engine.run_cycle(false, 10_999).is_empty());
        assert!(engine.mqtt_is_mqtt());

        let actions = engine.run_cycle(false, 11_000);
        assert_eq!(
            actions,
            vec![
                CarouselAction::SetLights(5),
                CarouselAction::Trigger(TriggerLevel::Inactive),
            ]
        );
        assert!(!engine.mqtt_is_mqtt());
        assert!(!engine.is_remote_busy());
        assert_eq!(engine.light(), 5);
    }

    #[test]
    fn stepped_music_pulses_the_trigger() {
        let mut engine = CarouselEngine::new(
            CarouselConfig {
                music_play_songs: 2,
                ..CarouselConfig::default()
            },
            0,
        );
        engine.mqtt_set_command(RemoteCommand::MUSIC_ID);
        engine.mqtt_set_mqtt(true);

        let mut triggers = Vec::new();
        let mut now = 0;
        while now <= 20_000 {
            for action in engine.run_cycle(false, now) {
                if let CarouselAction::Trigger(level) = action {
                    triggers.push(level);
                }
            }
            if !engine.mqtt_is_mqtt() {
                break;
            }
            now += 5;
        }

        assert_eq!(
            triggers,
            vec![
                // Teardown before the routine.
                TriggerLevel::Inactive,
                TriggerLevel::Active,
                TriggerLevel::Inactive,
                TriggerLevel::Active,
                TriggerLevel::Inactive,
                // Closing teardown.
                TriggerLevel::Inactive,
            ]
        );
        assert!(!engine.mqtt_is_mqtt());
    }

    #[test]
    fn presence_resumes_after_remote_run() {
        let mut engine = engine();
        engine.mqtt_set_command(RemoteCommand::LIGHTS_ID);
        engine.mqtt_set_mqtt(true);
        let _ = engine.run_cycle(true, 0);
        let _ = engine.run_cycle(true, 10_000);
        assert!(!engine.mqtt_is_mqtt());

        let actions = engine.run_cycle(true, 10_005);
        assert!(engine.is_pir());
        assert_eq!(
            &actions[..3],
            &[
                CarouselAction::Trigger(TriggerLevel::Active),
                CarouselAction::SetWheel(110),
                CarouselAction::SetLights(200),
            ]
        );
        // The sweep timer went stale during the demo, so it steps at once.
        assert_eq!(actions.len(), 7);
    }

    #[test]
    fn unknown_command_is_reported_and_cleared() {
        let mut engine = engine();
        engine.mqtt_set_command(0x7f);
        engine.mqtt_set_mqtt(true);

        let actions = engine.mqtt_check_status(0);

        assert!(!engine.mqtt_is_mqtt());
        assert!(!engine.is_remote_busy());
        assert!(actions
            .iter()
            .all(|action| matches!(action, CarouselAction::Trigger(TriggerLevel::Inactive))));
        assert_eq!(engine.rejected_commands(), 1);
        assert_eq!(engine.take_command_error(), Some(CommandError::Unknown(0x7f)));
        assert_eq!(engine.take_command_error(), None);
    }

    #[test]
    fn unknown_command_in_blocking_exec() {
        let mut engine = blocking_engine();
        engine.mqtt_set_command(9);
        engine.mqtt_set_mqtt(true);

        let actions = engine.mqtt_exec_command(0);

        assert_eq!(
            actions,
            vec![CarouselAction::Trigger(TriggerLevel::Inactive)]
        );
        assert_eq!(engine.rejected_commands(), 1);
    }

    #[test]
    fn clearing_the_flag_abandons_a_run() {
        let mut engine = engine();
        engine.mqtt_set_command(RemoteCommand::RUN_ID);
        engine.mqtt_set_mqtt(true);
        let _ = engine.mqtt_check_status(0);
        assert!(engine.is_remote_busy());

        engine.mqtt_set_mqtt(false);
        assert!(!engine.is_remote_busy());
        assert!(engine.mqtt_check_status(100_000).is_empty());

        // The next loop releases the trigger and rewrites standby set-points.
        assert_eq!(
            engine.run_cycle(false, 100_001),
            vec![
                CarouselAction::Trigger(TriggerLevel::Inactive),
                CarouselAction::SetWheel(90),
                CarouselAction::SetLights(5),
            ]
        );
        assert!(engine.update_hardware(100_002).is_empty());
    }

    #[test]
    fn ending_a_stepped_run_early_restores_standby_outputs() {
        let mut engine = engine();
        engine.mqtt_set_command(RemoteCommand::LIGHTS_ID);
        engine.mqtt_set_mqtt(true);
        let started = engine.run_cycle(false, 0);
        assert!(started.contains(&CarouselAction::SetLights(200)));

        let mut teardown = engine.mqtt_end_carousel();
        teardown.extend(engine.update_hardware(1_000));

        assert_eq!(
            teardown,
            vec![
                CarouselAction::Trigger(TriggerLevel::Inactive),
                CarouselAction::SetWheel(90),
                CarouselAction::SetLights(5),
            ]
        );
        assert_eq!(engine.light(), 5);
    }

    #[test]
    fn finished_run_does_not_rewrite_outputs() {
        let mut engine = engine();
        engine.mqtt_set_command(RemoteCommand::LIGHTS_ID);
        engine.mqtt_set_mqtt(true);
        let _ = engine.run_cycle(false, 0);
        let _ = engine.run_cycle(false, 10_000);

        assert!(!engine.mqtt_is_mqtt());
        assert!(engine.update_hardware(10_005).is_empty());
    }

    #[test]
    fn blocking_command_holds_off_new_commands_for_its_duration() {
        let mut engine = blocking_engine();
        engine.mqtt_set_command(RemoteCommand::MUSIC_ID);
        engine.mqtt_set_mqtt(true);

        let actions = engine.mqtt_check_status(100);
        let duration = RemoteCommand::Music.duration_ms(engine.config());

        assert_eq!(waits(&actions), duration);
        assert!(!engine.mqtt_is_mqtt());
        assert!(!engine.accepts_command(100 + duration - 1));
        assert!(engine.state_payload(100 + duration - 1).remote_busy);
        assert!(engine.accepts_command(100 + duration));
        assert!(!engine.state_payload(100 + duration).remote_busy);
    }

    #[test]
    fn degenerate_sweep_falls_back_to_defaults() {
        let config = CarouselConfig {
            min_angle: 0,
            max_angle: 0,
            ..CarouselConfig::default()
        };
        let mut engine = CarouselEngine::new(config, 0);
        let defaults = CarouselConfig::default();

        assert_eq!(engine.config().min_angle, defaults.min_angle);
        assert_eq!(engine.config().max_angle, defaults.max_angle);

        let moves = engine.step_light_servo();
        assert_eq!(moves.len(), 4);
        assert_eq!(
            engine.status().servo_pos,
            [
                defaults.min_angle + 1,
                defaults.max_angle - 1,
                defaults.min_angle + 1,
                defaults.max_angle - 1,
            ]
        );
    }

    #[test]
    fn state_payload_reflects_status() {
        let mut engine = CarouselEngine::new(CarouselConfig::default(), 1_000);
        let _ = engine.check_pir_status(true, 1_000);
        let _ = engine.update_hardware(1_000);

        let payload = engine.state_payload(6_500);
        assert!(payload.pir);
        assert!(payload.is_rotating);
        assert_eq!(payload.elapsed_sec, 5);
        assert_eq!(payload.servo_pos, [10, 90, 10, 90]);
        assert_eq!(payload.rotation_dir_a, "CLOCKWISE");
        assert_eq!(payload.remote_command, None);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["servoPos"], serde_json::json!([10, 90, 10, 90]));
        assert_eq!(json["rejectedCommands"], 0);
    }

    proptest! {
        #[test]
        fn sweep_stays_within_bounds(
            start_a in 0u8..=180,
            start_b in 0u8..=180,
            clockwise_a in any::<bool>(),
            clockwise_b in any::<bool>(),
            steps in 1usize..400,
        ) {
            let mut engine = engine();
            engine.status.servo_pos = [start_a, start_b, start_a, start_b];
            engine.status.rotation_dir_a =
                if clockwise_a { Rotation::Clockwise } else { Rotation::Counterclockwise };
            engine.status.rotation_dir_b =
                if clockwise_b { Rotation::Clockwise } else { Rotation::Counterclockwise };

            for _ in 0..steps {
                let _ = engine.step_light_servo();
                let pos = engine.status.servo_pos;
                for angle in pos {
                    prop_assert!((10..=90).contains(&angle));
                }
                prop_assert_eq!(pos[LIGHT1], pos[LIGHT3]);
                prop_assert_eq!(pos[LIGHT2], pos[LIGHT4]);
            }
        }

        #[test]
        fn step_moves_one_degree_or_reverses(start in 11u8..=89, clockwise in any::<bool>()) {
            let mut engine = engine();
            engine.status.servo_pos = [start; LIGHT_SERVO_COUNT];
            let direction = if clockwise { Rotation::Clockwise } else { Rotation::Counterclockwise };
            engine.status.rotation_dir_a = direction;

            let _ = engine.step_light_servo();
            let moved = i16::from(engine.status.servo_pos[LIGHT1]);
            let expected = i16::from(start) + direction.increment();

            if (11..=89).contains(&expected) {
                prop_assert_eq!(moved, expected);
                prop_assert_eq!(engine.status.rotation_dir_a, direction);
            } else {
                prop_assert_ne!(engine.status.rotation_dir_a, direction);
            }
        }

        #[test]
        fn remote_always_clears_presence(presence in any::<bool>(), id in 0i32..6) {
            let mut engine = blocking_engine();
            let _ = engine.check_pir_status(presence, 0);
            engine.mqtt_set_command(id);
            engine.mqtt_set_mqtt(true);

            let _ = engine.mqtt_check_status(1);

            prop_assert!(!engine.is_pir());
            prop_assert!(!engine.mqtt_is_mqtt());
        }
    }
}
