use crate::{ChannelState, EndpointError, EndpointRegistry, EndpointStatus, StreamId};

/// Snapshot of every endpoint the registry holds.
pub fn get_status(registry: &EndpointRegistry) -> Vec<EndpointStatus> {
    registry.status()
}

/// Set a stream's volume in decibels. Returns `false` if the stream is unknown.
pub fn set_volume_db(registry: &EndpointRegistry, id: StreamId, volume_db: f32) -> bool {
    let linear = if volume_db <= -120.0 {
        0.0
    } else {
        10f32.powf(volume_db / 20.0)
    };
    registry
        .endpoint_for_stream(id)
        .is_some_and(|endpoint| endpoint.set_stream_volume(id, linear).is_ok())
}

/// Start a stopped stream or stop a running one, returning the new state.
pub fn toggle_running(
    registry: &EndpointRegistry,
    id: StreamId,
) -> Result<ChannelState, EndpointError> {
    let endpoint = registry
        .endpoint_for_stream(id)
        .ok_or(EndpointError::UnknownStream(id))?;
    let running = endpoint
        .status()
        .channels
        .iter()
        .any(|c| c.id == id && c.state == ChannelState::Running);
    if running {
        endpoint.stop_stream(id)?;
        Ok(ChannelState::Stopped)
    } else {
        endpoint.start_stream(id)?;
        Ok(ChannelState::Running)
    }
}

/// Linear gain expressed in decibels for display.
pub fn linear_to_db(linear: f32) -> f32 {
    if linear > 0.0 {
        20.0 * linear.log10()
    } else {
        f32::NEG_INFINITY
    }
}
