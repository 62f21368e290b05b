pub mod carousel;
pub mod config;
pub mod hardware;
pub mod remote;
pub mod topics;
pub mod types;

pub use carousel::{CarouselAction, CarouselEngine, CommandError, MachineStatus};
pub use config::{CarouselConfig, NetworkConfig, PinConfig, RuntimeConfig};
pub use hardware::{CarouselOutputs, HardwareError, ServoOutput};
pub use topics::*;
pub use types::{CarouselStatePayload, RemoteCommand, Rotation, TriggerLevel};
