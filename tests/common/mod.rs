#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use endpoint_kit::hardware::channel_mask_for;
use endpoint_kit::{
    EndpointOptions, HardwareError, HardwareFactory, HardwareParams, HardwareStream,
    StreamConfig, ThreadPriority,
};

pub const FRAMES_PER_BURST: usize = 64;
const KEPT_BURSTS: usize = 512;

/// What the next hardware write does.
#[derive(Clone, Debug)]
pub enum WriteOutcome {
    Full,
    Short(usize),
    Fail(HardwareError),
}

/// Observable and scriptable side of a [`MockHardware`].
#[derive(Default)]
pub struct MockState {
    pub open_error: Mutex<Option<HardwareError>>,
    pub reported_rate: Mutex<Option<u32>>,
    script: Mutex<VecDeque<WriteOutcome>>,
    bursts: Mutex<VecDeque<Vec<f32>>>,
    last_timeout: Mutex<Option<Duration>>,
    writes: AtomicUsize,
    closes: AtomicUsize,
}

impl MockState {
    pub fn script(&self, outcomes: impl IntoIterator<Item = WriteOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    pub fn bursts(&self) -> Vec<Vec<f32>> {
        self.bursts.lock().iter().cloned().collect()
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        *self.last_timeout.lock()
    }
}

pub struct MockHardware {
    state: Arc<MockState>,
    channels: usize,
}

impl MockHardware {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state, channels: 0 }
    }
}

impl HardwareStream for MockHardware {
    fn open(&mut self, config: &StreamConfig) -> Result<HardwareParams, HardwareError> {
        if let Some(err) = self.state.open_error.lock().clone() {
            return Err(err);
        }
        self.channels = config.channel_count;
        Ok(HardwareParams {
            sample_rate: self.state.reported_rate.lock().unwrap_or(config.sample_rate),
            frames_per_burst: config.frames_per_burst.unwrap_or(FRAMES_PER_BURST),
            channel_mask: channel_mask_for(config.channel_count),
        })
    }

    fn write(
        &mut self,
        samples: &[f32],
        frames: usize,
        timeout: Duration,
    ) -> Result<usize, HardwareError> {
        std::thread::sleep(Duration::from_millis(1));
        *self.state.last_timeout.lock() = Some(timeout);
        self.state.writes.fetch_add(1, Ordering::AcqRel);
        let outcome = self
            .state
            .script
            .lock()
            .pop_front()
            .unwrap_or(WriteOutcome::Full);
        match outcome {
            WriteOutcome::Full => {
                let mut bursts = self.state.bursts.lock();
                bursts.push_back(samples[..frames * self.channels].to_vec());
                if bursts.len() > KEPT_BURSTS {
                    bursts.pop_front();
                }
                Ok(frames)
            }
            WriteOutcome::Short(written) => Ok(written),
            WriteOutcome::Fail(err) => Err(err),
        }
    }

    fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::AcqRel);
    }
}

/// Factory recording the state of every stream it hands out.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockState>>>,
    open_error: Mutex<Option<HardwareError>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_opens_with(&self, err: Option<HardwareError>) {
        *self.open_error.lock() = err;
    }

    pub fn created(&self) -> Vec<Arc<MockState>> {
        self.created.lock().clone()
    }

    pub fn latest(&self) -> Arc<MockState> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no hardware created yet")
    }
}

impl HardwareFactory for MockFactory {
    fn create(&self, _config: &StreamConfig) -> Box<dyn HardwareStream> {
        let state = Arc::new(MockState::default());
        *state.open_error.lock() = self.open_error.lock().clone();
        self.created.lock().push(state.clone());
        Box::new(MockHardware::new(state))
    }
}

pub fn test_config() -> StreamConfig {
    StreamConfig {
        frames_per_burst: Some(FRAMES_PER_BURST),
        ..StreamConfig::default()
    }
}

pub fn test_options() -> EndpointOptions {
    EndpointOptions {
        thread_priority: ThreadPriority::Normal,
        volume_ramp_bursts: 0,
        ..EndpointOptions::default()
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
