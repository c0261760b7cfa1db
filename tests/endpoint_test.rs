mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    FRAMES_PER_BURST, MockHardware, MockState, WriteOutcome, test_config, test_options,
    wait_until,
};
use endpoint_kit::{
    ChannelState, ClientChannel, EndpointError, EndpointHealth, EndpointOptions, HardwareError,
    LoopExit, ServiceEndpoint, StreamConfig, StreamEvent, StreamId,
};

const WAIT: Duration = Duration::from_secs(5);

fn endpoint_with(
    config: StreamConfig,
    options: EndpointOptions,
) -> (ServiceEndpoint, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let endpoint = ServiceEndpoint::new(config, options, Box::new(MockHardware::new(state.clone())));
    (endpoint, state)
}

fn open_endpoint() -> (ServiceEndpoint, Arc<MockState>) {
    let (endpoint, state) = endpoint_with(test_config(), test_options());
    endpoint.open().expect("open endpoint");
    (endpoint, state)
}

fn registered_channel(endpoint: &ServiceEndpoint, fill: f32) -> Arc<ClientChannel> {
    let channel = endpoint.create_channel().expect("create channel");
    let frames = channel.ring().available_write();
    channel.write(&vec![fill; frames * channel.channel_count()]);
    endpoint
        .register_stream(channel.clone())
        .expect("register channel");
    channel
}

#[test]
fn open_reports_unsupported_configuration() {
    let (endpoint, state) = endpoint_with(test_config(), test_options());
    *state.open_error.lock() = Some(HardwareError::Unsupported("96 kHz".into()));
    assert!(matches!(
        endpoint.open(),
        Err(EndpointError::ConfigurationUnsupported(_))
    ));
    assert!(!endpoint.is_open());
}

#[test]
fn open_rejects_hardware_that_changes_the_rate() {
    let (endpoint, state) = endpoint_with(test_config(), test_options());
    *state.reported_rate.lock() = Some(44_100);
    assert!(matches!(
        endpoint.open(),
        Err(EndpointError::ConfigurationUnsupported(_))
    ));
    assert_eq!(state.closes(), 1);
}

#[test]
fn open_and_close_enforce_state_machine() {
    let (endpoint, state) = endpoint_with(test_config(), test_options());
    let early = Arc::new(ClientChannel::new(StreamId::next(), 128, 2));
    assert!(matches!(
        endpoint.register_stream(early),
        Err(EndpointError::NotOpen)
    ));
    assert!(matches!(endpoint.close(), Err(EndpointError::NotOpen)));

    endpoint.open().expect("open");
    assert!(matches!(endpoint.open(), Err(EndpointError::AlreadyOpen)));
    assert_eq!(endpoint.frames_per_burst(), Some(FRAMES_PER_BURST));
    assert_eq!(endpoint.buffer_size_frames(), Some(2 * FRAMES_PER_BURST));

    endpoint.close().expect("close");
    assert_eq!(state.closes(), 1);
    assert!(matches!(endpoint.close(), Err(EndpointError::NotOpen)));

    endpoint.open().expect("reopen");
    assert!(endpoint.is_usable());
}

#[test]
fn register_enforces_capacity_and_layout() {
    let options = EndpointOptions {
        max_channels: 2,
        ..test_options()
    };
    let (endpoint, _state) = endpoint_with(test_config(), options);
    endpoint.open().expect("open");

    let mono = Arc::new(ClientChannel::new(StreamId::next(), 128, 1));
    assert!(matches!(
        endpoint.register_stream(mono),
        Err(EndpointError::ChannelMismatch {
            expected: 2,
            actual: 1
        })
    ));

    let first = registered_channel(&endpoint, 0.0);
    endpoint
        .register_stream(first.clone())
        .expect("re-registering is a no-op");
    registered_channel(&endpoint, 0.0);
    let third = endpoint.create_channel().expect("create");
    assert!(matches!(
        endpoint.register_stream(third),
        Err(EndpointError::CapacityExceeded(2))
    ));
    assert_eq!(endpoint.registered_streams().len(), 2);
}

#[test]
fn unregister_is_idempotent() {
    let (endpoint, _state) = open_endpoint();
    let channel = registered_channel(&endpoint, 0.0);
    endpoint.unregister_stream(channel.id()).expect("unregister");
    endpoint
        .unregister_stream(channel.id())
        .expect("second unregister");
    endpoint
        .unregister_stream(StreamId(u32::MAX))
        .expect("unknown id");
    assert!(endpoint.registered_streams().is_empty());
    assert!(matches!(
        endpoint.start_stream(channel.id()),
        Err(EndpointError::UnknownStream(_))
    ));
}

#[test]
fn only_running_channels_reach_the_hardware() {
    let (endpoint, state) = open_endpoint();
    let running = registered_channel(&endpoint, 0.25);
    let stopped = registered_channel(&endpoint, 0.5);

    endpoint.start_stream(running.id()).expect("start");
    assert!(endpoint.is_streaming());
    assert!(wait_until(WAIT, || state
        .bursts()
        .iter()
        .any(|b| b.contains(&0.25))));
    endpoint.stop_stream(running.id()).expect("stop");

    for burst in state.bursts() {
        assert_eq!(burst.len(), FRAMES_PER_BURST * 2);
        assert!(burst.iter().all(|s| *s == 0.25 || *s == 0.0), "{burst:?}");
    }
    assert_eq!(stopped.ring().available_read(), stopped.ring().capacity_frames());
    assert_eq!(stopped.status().frames_mixed, 0);
    assert!(running.status().frames_mixed > 0);
}

#[test]
fn volume_scales_a_channel() {
    let (endpoint, state) = open_endpoint();
    let channel = registered_channel(&endpoint, 1.0);
    endpoint
        .set_stream_volume(channel.id(), 0.5)
        .expect("set volume");
    endpoint.start_stream(channel.id()).expect("start");
    assert!(wait_until(WAIT, || state
        .bursts()
        .iter()
        .any(|b| b.contains(&0.5))));
    endpoint.stop_stream(channel.id()).expect("stop");
    assert!(
        state
            .bursts()
            .iter()
            .flatten()
            .all(|s| *s == 0.5 || *s == 0.0)
    );
}

#[test]
fn loop_idles_when_last_channel_stops() {
    let (endpoint, state) = open_endpoint();
    let channel = registered_channel(&endpoint, 0.1);
    let events = channel.subscribe();

    endpoint.start_stream(channel.id()).expect("start");
    assert!(wait_until(WAIT, || state.writes() > 2));
    endpoint.stop_stream(channel.id()).expect("stop");
    assert!(!endpoint.is_streaming());
    assert_eq!(endpoint.last_exit(), Some(LoopExit::Stopped));
    let writes = state.writes();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(state.writes(), writes);

    endpoint.start_stream(channel.id()).expect("restart");
    assert!(wait_until(WAIT, || state.writes() > writes));
    endpoint.close().expect("close");
    assert_eq!(channel.state(), ChannelState::Stopped);

    let seen: Vec<StreamEvent> = events.try_iter().collect();
    assert_eq!(
        seen,
        [
            StreamEvent::Started,
            StreamEvent::Stopped,
            StreamEvent::Started,
            StreamEvent::Stopped
        ]
    );
    assert_eq!(
        state.last_timeout(),
        Some(test_options().write_timeout(FRAMES_PER_BURST, 48_000))
    );
}

#[test]
fn idle_channel_never_stalls_the_loop() {
    let (endpoint, state) = open_endpoint();
    let idle = endpoint.create_channel().expect("create");
    endpoint.register_stream(idle.clone()).expect("register");
    let active = registered_channel(&endpoint, 0.0);

    endpoint.start_stream(active.id()).expect("start");
    assert!(wait_until(WAIT, || endpoint.status().bursts_written >= 20));
    assert_eq!(idle.state(), ChannelState::Stopped);
    assert_eq!(idle.status().frames_mixed, 0);
    assert_eq!(idle.underflow_count(), 0);
    assert!(active.underflow_count() > 0);
}

#[test]
fn disconnect_stops_every_channel() {
    let (endpoint, state) = open_endpoint();
    state.script([
        WriteOutcome::Full,
        WriteOutcome::Full,
        WriteOutcome::Fail(HardwareError::Disconnected),
    ]);
    let running = registered_channel(&endpoint, 0.2);
    let stopped = registered_channel(&endpoint, 0.2);
    let events = running.subscribe();

    endpoint.start_stream(running.id()).expect("start");
    assert!(wait_until(WAIT, || endpoint.last_exit().is_some()));

    assert_eq!(endpoint.last_exit(), Some(LoopExit::Disconnected));
    assert_eq!(endpoint.health(), EndpointHealth::Disconnected);
    assert!(!endpoint.is_usable());
    assert_eq!(running.state(), ChannelState::Disconnected);
    assert_eq!(stopped.state(), ChannelState::Disconnected);
    assert!(events.try_iter().any(|e| e == StreamEvent::Disconnected));
    assert!(matches!(
        endpoint.start_stream(stopped.id()),
        Err(EndpointError::Disconnected)
    ));
    assert_eq!(state.writes(), 3);
    endpoint.close().expect("close after disconnect");
}

#[test]
fn short_write_faults_the_endpoint() {
    let (endpoint, state) = open_endpoint();
    state.script([WriteOutcome::Full, WriteOutcome::Short(10)]);
    let channel = registered_channel(&endpoint, 0.2);
    let events = channel.subscribe();

    endpoint.start_stream(channel.id()).expect("start");
    assert!(wait_until(WAIT, || endpoint.last_exit().is_some()));

    assert_eq!(
        endpoint.last_exit(),
        Some(LoopExit::ShortWrite {
            written: 10,
            requested: FRAMES_PER_BURST
        })
    );
    assert_eq!(endpoint.health(), EndpointHealth::Faulted);
    assert_eq!(channel.state(), ChannelState::Faulted);
    assert!(
        events
            .try_iter()
            .any(|e| matches!(e, StreamEvent::Faulted(_)))
    );
    assert!(matches!(
        endpoint.start_stream(channel.id()),
        Err(EndpointError::StreamFault(_))
    ));
}

#[test]
fn write_error_faults_the_endpoint() {
    let (endpoint, state) = open_endpoint();
    state.script([WriteOutcome::Fail(HardwareError::Timeout)]);
    let channel = registered_channel(&endpoint, 0.2);

    endpoint.start_stream(channel.id()).expect("start");
    assert!(wait_until(WAIT, || endpoint.last_exit().is_some()));
    assert!(matches!(
        endpoint.last_exit(),
        Some(LoopExit::WriteFailed(_))
    ));
    assert_eq!(channel.state(), ChannelState::Faulted);
    assert_eq!(endpoint.status().bursts_written, 0);
}

#[test]
fn underflows_are_reported_while_streaming() {
    let (endpoint, _state) = open_endpoint();
    let channel = endpoint.create_channel().expect("create");
    endpoint.register_stream(channel.clone()).expect("register");

    endpoint.start_stream(channel.id()).expect("start");
    assert!(wait_until(WAIT, || endpoint.status().underflows >= 3));
    assert!(endpoint.is_streaming());
    assert!(channel.underflow_count() >= 3);
    endpoint.stop_stream(channel.id()).expect("stop");
    assert_eq!(endpoint.status().underflows, channel.underflow_count());
}

#[test]
fn stream_config_overrides_buffer_depth() {
    let config = StreamConfig {
        bursts_per_buffer: Some(3),
        ..test_config()
    };
    let (endpoint, _state) = endpoint_with(config, test_options());
    endpoint.open().expect("open");
    assert_eq!(endpoint.buffer_size_frames(), Some(3 * FRAMES_PER_BURST));
    assert_eq!(endpoint.status().buffer_size_frames, 3 * FRAMES_PER_BURST);
}
