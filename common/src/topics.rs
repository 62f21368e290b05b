pub const TOPIC_CMD_START: &str = "carousel/start";

pub const TOPIC_CAROUSEL_STATE: &str = "carousel/state";

// Host builds only: stands in for the PIR input pin.
pub const TOPIC_SIM_PRESENCE: &str = "carousel/sim/presence";
