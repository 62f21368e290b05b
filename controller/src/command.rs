use carousel_common::CarouselEngine;

/// Latches a remote command for the control loop. Refused while another
/// command is pending or running, including the waits of a blocking command;
/// commands are not queued.
pub fn submit_command(engine: &mut CarouselEngine, command_id: i32, now_ms: u64) -> bool {
    if !engine.accepts_command(now_ms) {
        return false;
    }
    engine.mqtt_set_command(command_id);
    engine.mqtt_set_mqtt(true);
    true
}
