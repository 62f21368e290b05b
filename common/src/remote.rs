use std::collections::VecDeque;

use crate::{
    carousel::CarouselAction,
    config::CarouselConfig,
    types::{RemoteCommand, TriggerLevel},
};

impl RemoteCommand {
    /// Compiles the demo routine into actuator steps with explicit waits.
    pub fn plan(self, config: &CarouselConfig) -> Vec<CarouselAction> {
        let mut steps = Vec::new();
        match self {
            Self::Lights => {
                steps.push(CarouselAction::SetLights(config.high_light));
                steps.push(CarouselAction::Delay(config.lights_timeout_ms));
                steps.push(CarouselAction::SetLights(config.low_light));
            }
            Self::Music => push_music_steps(config, &mut steps),
            Self::Run => {
                steps.push(CarouselAction::SetLights(config.high_light));
                push_music_steps(config, &mut steps);
                steps.push(CarouselAction::SetLights(config.low_light));
            }
        }
        steps
    }

    pub fn duration_ms(self, config: &CarouselConfig) -> u64 {
        match self {
            Self::Lights => config.lights_timeout_ms,
            Self::Music | Self::Run => config.music_duration_ms(),
        }
    }
}

// Each pulse advances the external player by one track; its track cursor is
// not ours to read.
fn push_music_steps(config: &CarouselConfig, steps: &mut Vec<CarouselAction>) {
    for _ in 0..config.music_play_songs {
        steps.push(CarouselAction::Trigger(TriggerLevel::Active));
        steps.push(CarouselAction::Delay(config.music_timeout_ms));
        steps.push(CarouselAction::Trigger(TriggerLevel::Inactive));
        steps.push(CarouselAction::Delay(config.trigger_settle_ms));
    }
}

/// A remote command plan executed across loop ticks instead of in one
/// blocking call.
#[derive(Debug, Clone)]
pub(crate) struct RemoteRun {
    command: RemoteCommand,
    steps: VecDeque<CarouselAction>,
    resume_at_ms: Option<u64>,
}

impl RemoteRun {
    pub(crate) fn new(command: RemoteCommand, config: &CarouselConfig) -> Self {
        Self {
            command,
            steps: command.plan(config).into(),
            resume_at_ms: None,
        }
    }

    pub(crate) fn command(&self) -> RemoteCommand {
        self.command
    }

    /// Emits every step that is due, stopping at the first wait that has not
    /// elapsed yet.
    pub(crate) fn advance(&mut self, now_ms: u64) -> Vec<CarouselAction> {
        let mut due = Vec::new();

        if let Some(resume_at) = self.resume_at_ms {
            if now_ms < resume_at {
                return due;
            }
            self.resume_at_ms = None;
        }

        while let Some(step) = self.steps.pop_front() {
            match step {
                CarouselAction::Delay(ms) if ms > 0 => {
                    self.resume_at_ms = Some(now_ms.saturating_add(ms));
                    break;
                }
                CarouselAction::Delay(_) => {}
                action => due.push(action),
            }
        }

        due
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.steps.is_empty() && self.resume_at_ms.is_none()
    }
}
