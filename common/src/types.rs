use serde::Serialize;

/// Sweep direction of an oscillation pair, one degree per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Clockwise,
    Counterclockwise,
}

impl Rotation {
    pub fn increment(self) -> i16 {
        match self {
            Self::Clockwise => 1,
            Self::Counterclockwise => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clockwise => "CLOCKWISE",
            Self::Counterclockwise => "COUNTERCLOCKWISE",
        }
    }
}

/// Level of the audio player trigger line.
///
/// The player keeps playing while the line is held low and stops when it is
/// released high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerLevel {
    Active,
    Inactive,
}

impl TriggerLevel {
    pub fn is_high(self) -> bool {
        matches!(self, Self::Inactive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Lights,
    Music,
    Run,
}

impl RemoteCommand {
    pub const LIGHTS_ID: i32 = 0x01;
    pub const MUSIC_ID: i32 = 0x02;
    pub const RUN_ID: i32 = 0x03;

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            Self::LIGHTS_ID => Some(Self::Lights),
            Self::MUSIC_ID => Some(Self::Music),
            Self::RUN_ID => Some(Self::Run),
            _ => None,
        }
    }

    pub fn id(self) -> i32 {
        match self {
            Self::Lights => Self::LIGHTS_ID,
            Self::Music => Self::MUSIC_ID,
            Self::Run => Self::RUN_ID,
        }
    }

    /// Payload name published on the command topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lights => "mqtt_lights",
            Self::Music => "mqtt_music",
            Self::Run => "mqtt_run",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [Self::Lights, Self::Music, Self::Run]
            .into_iter()
            .find(|command| name.eq_ignore_ascii_case(command.as_str()))
    }
}

/// Decodes a command topic payload into a raw command identifier.
///
/// Known names map to their identifier, bare integers pass through unchanged
/// so that the engine can report identifiers it does not know. Anything else
/// is not a command.
pub fn parse_command_payload(payload: &str) -> Option<i32> {
    let trimmed = payload.trim();
    if let Some(command) = RemoteCommand::from_name(trimmed) {
        return Some(command.id());
    }
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"));
    match digits {
        Some(hex) => i32::from_str_radix(hex, 16).ok(),
        None => trimmed.parse::<i32>().ok(),
    }
}

/// Decodes a presence simulation payload (`on`/`off`/`1`/`0`).
pub fn parse_presence_payload(payload: &str) -> Option<bool> {
    let trimmed = payload.trim();
    if trimmed.eq_ignore_ascii_case("on") || trimmed == "1" || trimmed.eq_ignore_ascii_case("true")
    {
        Some(true)
    } else if trimmed.eq_ignore_ascii_case("off")
        || trimmed == "0"
        || trimmed.eq_ignore_ascii_case("false")
    {
        Some(false)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CarouselStatePayload {
    pub pir: bool,
    pub mqtt: bool,
    #[serde(rename = "mqttCommand")]
    pub mqtt_command: i32,
    pub wheel: u8,
    #[serde(rename = "isRotating")]
    pub is_rotating: bool,
    pub light: u8,
    #[serde(rename = "servoPos")]
    pub servo_pos: [u8; 4],
    #[serde(rename = "rotationDirA")]
    pub rotation_dir_a: &'static str,
    #[serde(rename = "rotationDirB")]
    pub rotation_dir_b: &'static str,
    #[serde(rename = "elapsedSec")]
    pub elapsed_sec: u64,
    #[serde(rename = "remoteBusy")]
    pub remote_busy: bool,
    #[serde(rename = "remoteCommand")]
    pub remote_command: Option<&'static str>,
    #[serde(rename = "rejectedCommands")]
    pub rejected_commands: u64,
}
