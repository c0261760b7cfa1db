#![deny(missing_docs)]

//! Shared audio endpoint engine: many client streams mixed onto one hardware stream.
//!
//! Each client writes interleaved `f32` frames into its own lock-free
//! [`SharedRingBuffer`](ring::SharedRingBuffer). A [`ServiceEndpoint`] owns one
//! [`HardwareStream`](hardware::HardwareStream) and, while any client is running, mixes a burst
//! from every running client on a dedicated thread and writes it to the hardware with a bounded
//! blocking write. An [`EndpointRegistry`] shares endpoints between clients that ask for the same
//! configuration and closes them when the last client lets go.

use std::collections::VecDeque;
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub mod channel;
pub mod config;
/// Developer-facing status and control surface.
pub mod control;
pub mod endpoint;
pub mod fifo;
pub mod hardware;
pub mod mixer;
pub mod priority;
pub mod registry;
pub mod ring;
pub mod tone;

#[cfg(test)]
mod tests;

pub use channel::{ChannelState, ChannelStatus, ClientChannel, StreamEvent, StreamId};
pub use config::{EndpointOptions, OutputLimiter, SampleFormat, StreamConfig, ThreadPriority};
pub use endpoint::{EndpointHealth, EndpointStatus, LoopExit, ServiceEndpoint};
pub use fifo::RingBufferController;
pub use hardware::{HardwareError, HardwareFactory, HardwareParams, HardwareStream};
pub use mixer::MixEngine;
pub use registry::{EndpointHandle, EndpointRegistry};
pub use ring::{SharedRingBuffer, monotonic_timestamp_ns};

const LOG_CAPACITY: usize = 256;

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static TRACING_INIT: Once = Once::new();

/// Install a `tracing_subscriber` formatter once per process.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub(crate) fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// Pop the oldest lifecycle log line, if any.
pub fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}

/// Errors surfaced by endpoints and the registry.
#[derive(thiserror::Error, Debug)]
pub enum EndpointError {
    /// The hardware cannot realize the requested rate, format or channel layout.
    #[error("configuration unsupported: {0}")]
    ConfigurationUnsupported(String),
    /// `open` called on an open endpoint.
    #[error("endpoint already open")]
    AlreadyOpen,
    /// Operation requires an open endpoint.
    #[error("endpoint not open")]
    NotOpen,
    /// The endpoint already serves its maximum number of channels.
    #[error("endpoint already serves the maximum of {0} streams")]
    CapacityExceeded(usize),
    /// Channel layout differs from the endpoint's.
    #[error("stream has {actual} channels, endpoint mixes {expected}")]
    ChannelMismatch {
        /// Endpoint channel count.
        expected: usize,
        /// Channel count of the rejected stream.
        actual: usize,
    },
    /// No registered stream with this id.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    /// The hardware stream was lost; reacquire the endpoint.
    #[error("hardware stream disconnected")]
    Disconnected,
    /// The endpoint stopped after a fatal write failure; reacquire the endpoint.
    #[error("stream fault: {0}")]
    StreamFault(String),
    /// Hardware failure outside the cases above.
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    /// The mixing thread could not be started.
    #[error("failed to spawn mixing thread: {0}")]
    Spawn(#[from] std::io::Error),
}
