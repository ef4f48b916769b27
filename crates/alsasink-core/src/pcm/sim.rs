//! Deterministic in-memory PCM device
//!
//! Behaves like an ALSA mmap playback stream closely enough to drive the
//! negotiator, the recovery state machine and the period writer without
//! hardware:
//! - a capability set that negotiation is checked against
//! - a real byte ring with interleaved or per-channel layout; complex access
//!   keeps every channel in its own allocation
//! - a shared release counter bumped when the device is dropped
//! - application/hardware pointers, auto-start at the start threshold
//! - fault injection per operation, forced states, partial commits,
//!   grant limits and overridden channel layouts
//!
//! Every operation is recorded so tests can assert on call order.

use super::{ChannelArea, Frames, MmapGrant, PcmDevice, PcmError, PcmState, SwParams};
use crate::format::{decode, Access, FormatDescriptor, SampleFormat};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EINVAL: i32 = 22;
const EBADFD: i32 = 77;

/// Default rates offered by the simulated hardware
const DEFAULT_RATES: [u32; 4] = [44100, 48000, 88200, 96000];

/// Default geometry: 10 ms periods at 44.1 kHz, four per buffer
const DEFAULT_PERIOD_SIZE: Frames = 441;
const DEFAULT_PERIODS: Frames = 4;

/// Operations recorded by [`SimulatedPcm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    HwParamsAny,
    SetAccess,
    SetFormat,
    SetChannels,
    SetRate,
    SetBufferTime,
    SetPeriodTime,
    CommitHw,
    CommitSw,
    AvailUpdate,
    Start,
    Prepare,
    Resume,
    Wait,
    MmapBegin,
    MmapCommit,
}

/// What the simulated hardware is able to do
#[derive(Debug, Clone)]
pub struct SimCapabilities {
    pub access: Vec<Access>,
    pub formats: Vec<SampleFormat>,
    pub max_channels: u32,
    pub rates: Vec<u32>,
    /// Period size used when no period time is requested
    pub default_period_size: Frames,
    /// Buffer size used when no buffer time is requested
    pub default_buffer_size: Frames,
}

impl Default for SimCapabilities {
    fn default() -> Self {
        Self {
            access: vec![
                Access::MmapInterleaved,
                Access::MmapNoninterleaved,
                Access::MmapComplex,
            ],
            formats: SampleFormat::ALL.to_vec(),
            max_channels: 32,
            rates: DEFAULT_RATES.to_vec(),
            default_period_size: DEFAULT_PERIOD_SIZE,
            default_buffer_size: DEFAULT_PERIOD_SIZE * DEFAULT_PERIODS,
        }
    }
}

/// Simulated playback device
#[derive(Debug)]
pub struct SimulatedPcm {
    name: String,
    caps: SimCapabilities,

    // hardware configuration being narrowed
    access: Option<Access>,
    format: Option<SampleFormat>,
    channels: Option<u32>,
    rate: Option<u32>,
    buffer_size: Option<Frames>,
    period_size: Option<Frames>,
    committed: bool,
    sw_params: Option<SwParams>,

    // runtime
    state: PcmState,
    state_before_suspend: PcmState,
    /// One buffer per mapped segment
    ring: Vec<Vec<u8>>,
    areas: Vec<ChannelArea>,
    appl_ptr: u64,
    hw_ptr: u64,
    total_committed: u64,

    // fault injection
    failures: HashMap<SimOp, VecDeque<PcmError>>,
    commit_truncation: VecDeque<Frames>,
    grant_limit: Option<Frames>,
    grant_excess: Frames,
    area_override: Option<Vec<ChannelArea>>,
    drain_on_wait: bool,

    calls: Vec<SimOp>,
    released: Arc<AtomicUsize>,
}

impl SimulatedPcm {
    /// Create a device with default capabilities
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capabilities(name, SimCapabilities::default())
    }

    pub fn with_capabilities(name: impl Into<String>, caps: SimCapabilities) -> Self {
        Self {
            name: name.into(),
            caps,
            access: None,
            format: None,
            channels: None,
            rate: None,
            buffer_size: None,
            period_size: None,
            committed: false,
            sw_params: None,
            state: PcmState::Open,
            state_before_suspend: PcmState::Running,
            ring: Vec::new(),
            areas: Vec::new(),
            appl_ptr: 0,
            hw_ptr: 0,
            total_committed: 0,
            failures: HashMap::new(),
            commit_truncation: VecDeque::new(),
            grant_limit: None,
            grant_excess: 0,
            area_override: None,
            drain_on_wait: true,
            calls: Vec::new(),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next call of `op` fail with `err`
    ///
    /// Calls queue up: injecting twice fails the next two calls.
    pub fn fail_next(&mut self, op: SimOp, err: PcmError) -> &mut Self {
        self.failures.entry(op).or_default().push_back(err);
        self
    }

    /// Make the next `mmap_commit` accept at most `frames` frames
    pub fn truncate_next_commit(&mut self, frames: Frames) -> &mut Self {
        self.commit_truncation.push_back(frames);
        self
    }

    /// Cap every `mmap_begin` grant at `frames`
    pub fn limit_grant(&mut self, frames: Option<Frames>) -> &mut Self {
        self.grant_limit = frames;
        self
    }

    /// Grant `extra` frames more than asked for, as a broken driver might
    pub fn inflate_grant(&mut self, extra: Frames) -> &mut Self {
        self.grant_excess = extra;
        self
    }

    /// Report these channel areas from `mmap_begin` instead of the real layout
    pub fn override_areas(&mut self, areas: Vec<ChannelArea>) -> &mut Self {
        self.area_override = Some(areas);
        self
    }

    /// Whether `wait` plays one period worth of frames (default on)
    pub fn set_drain_on_wait(&mut self, drain: bool) -> &mut Self {
        self.drain_on_wait = drain;
        self
    }

    /// Force the hardware status, as a driver would on xrun or disconnect
    pub fn force_state(&mut self, state: PcmState) -> &mut Self {
        self.state = state;
        self
    }

    /// Enter the suspended state, remembering where to resume to
    pub fn suspend(&mut self) -> &mut Self {
        if self.state != PcmState::Suspended {
            self.state_before_suspend = self.state;
        }
        self.state = PcmState::Suspended;
        self
    }

    /// Consume `frames` frames as the hardware would while running
    ///
    /// Consuming more than is queued leaves the stream in xrun.
    pub fn play(&mut self, frames: Frames) {
        if self.state != PcmState::Running {
            return;
        }
        let queued = self.queued();
        if frames > queued {
            self.hw_ptr = self.appl_ptr;
            self.state = PcmState::Xrun;
        } else {
            self.hw_ptr += frames as u64;
        }
    }

    /// Frames committed but not yet played
    pub fn queued(&self) -> Frames {
        (self.appl_ptr - self.hw_ptr) as Frames
    }

    /// Sum of every successful commit since the device was opened
    pub fn total_committed(&self) -> u64 {
        self.total_committed
    }

    pub fn calls(&self) -> &[SimOp] {
        &self.calls
    }

    pub fn call_count(&self, op: SimOp) -> usize {
        self.calls.iter().filter(|&&c| c == op).count()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn sw_params(&self) -> Option<SwParams> {
        self.sw_params
    }

    /// Counter incremented each time this device is released
    ///
    /// The handle outlives the device, so tests can check the count after
    /// the owner has dropped it.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.released)
    }

    /// Raw bytes of one sample in the ring, addressed by ring frame index
    pub fn sample_bytes(&self, channel: usize, ring_frame: Frames) -> &[u8] {
        let width = self.descriptor().physical_bytes();
        let area = self.layout()[channel];
        let start = area.base + (area.first as usize + ring_frame * area.step as usize) / 8;
        &self.ring[area.segment][start..start + width]
    }

    /// Decoded value of one sample in the ring
    pub fn sample_value(&self, channel: usize, ring_frame: Frames) -> f64 {
        decode(self.sample_bytes(channel, ring_frame), &self.descriptor())
    }

    fn descriptor(&self) -> FormatDescriptor {
        FormatDescriptor::new(self.format.unwrap_or_default())
    }

    fn layout(&self) -> Vec<ChannelArea> {
        self.area_override
            .clone()
            .unwrap_or_else(|| self.areas.clone())
    }

    fn record(&mut self, op: SimOp) -> Result<(), PcmError> {
        self.calls.push(op);
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn status_error(&self) -> Result<(), PcmError> {
        match self.state {
            PcmState::Xrun => Err(PcmError::Xrun),
            PcmState::Suspended => Err(PcmError::Suspended),
            PcmState::Disconnected => Err(PcmError::Disconnected),
            _ => Ok(()),
        }
    }

    fn invalid(what: &str) -> PcmError {
        PcmError::backend(-EINVAL, format!("Invalid argument: {what}"))
    }

    fn frames_for(&self, time_us: u32) -> Frames {
        let rate = self.rate.unwrap_or(DEFAULT_RATES[0]) as u64;
        ((rate * time_us as u64 + 500_000) / 1_000_000).max(1) as Frames
    }

    fn time_for(&self, frames: Frames) -> u32 {
        let rate = self.rate.unwrap_or(DEFAULT_RATES[0]) as u64;
        (frames as u64 * 1_000_000 / rate) as u32
    }

    fn build_ring(&mut self) {
        let channels = self.channels.unwrap_or(1) as usize;
        let buffer_size = self.buffer_size.unwrap_or(0);
        let phys_bits = self.descriptor().physical_bits();
        let phys_bytes = phys_bits as usize / 8;

        let access = self.access.unwrap_or_default();
        self.ring = match access {
            Access::MmapComplex => vec![vec![0u8; buffer_size * phys_bytes]; channels],
            _ => vec![vec![0u8; buffer_size * channels * phys_bytes]],
        };
        self.areas = (0..channels)
            .map(|c| match access {
                Access::MmapInterleaved => ChannelArea {
                    segment: 0,
                    base: 0,
                    first: c as u32 * phys_bits,
                    step: channels as u32 * phys_bits,
                },
                Access::MmapNoninterleaved => ChannelArea {
                    segment: 0,
                    base: c * buffer_size * phys_bytes,
                    first: 0,
                    step: phys_bits,
                },
                Access::MmapComplex => ChannelArea {
                    segment: c,
                    base: 0,
                    first: 0,
                    step: phys_bits,
                },
            })
            .collect();
    }
}

impl PcmDevice for SimulatedPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn hw_params_any(&mut self) -> Result<(), PcmError> {
        self.record(SimOp::HwParamsAny)?;
        self.access = None;
        self.format = None;
        self.channels = None;
        self.rate = None;
        self.buffer_size = None;
        self.period_size = None;
        self.committed = false;
        Ok(())
    }

    fn set_access(&mut self, access: Access) -> Result<(), PcmError> {
        self.record(SimOp::SetAccess)?;
        if !self.caps.access.contains(&access) {
            return Err(Self::invalid(access.name()));
        }
        self.access = Some(access);
        Ok(())
    }

    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError> {
        self.record(SimOp::SetFormat)?;
        if !self.caps.formats.contains(&format) {
            return Err(Self::invalid(format.name()));
        }
        self.format = Some(format);
        Ok(())
    }

    fn set_channels(&mut self, channels: u32) -> Result<(), PcmError> {
        self.record(SimOp::SetChannels)?;
        if channels == 0 || channels > self.caps.max_channels {
            return Err(Self::invalid("channels"));
        }
        self.channels = Some(channels);
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError> {
        self.record(SimOp::SetRate)?;
        let nearest = self
            .caps
            .rates
            .iter()
            .copied()
            .min_by_key(|&r| r.abs_diff(rate))
            .ok_or_else(|| Self::invalid("rate"))?;
        self.rate = Some(nearest);
        Ok(nearest)
    }

    fn set_buffer_time_near(&mut self, buffer_time_us: u32) -> Result<u32, PcmError> {
        self.record(SimOp::SetBufferTime)?;
        let frames = self.frames_for(buffer_time_us);
        self.buffer_size = Some(frames);
        Ok(self.time_for(frames))
    }

    fn set_period_time_near(&mut self, period_time_us: u32) -> Result<u32, PcmError> {
        self.record(SimOp::SetPeriodTime)?;
        let mut frames = self.frames_for(period_time_us);
        if let Some(buffer_size) = self.buffer_size {
            frames = frames.min(buffer_size);
            // keep whole periods in the buffer, as most drivers do
            self.buffer_size = Some(buffer_size / frames * frames);
        }
        self.period_size = Some(frames);
        Ok(self.time_for(frames))
    }

    fn buffer_size(&self) -> Result<Frames, PcmError> {
        self.buffer_size
            .ok_or_else(|| Self::invalid("buffer size not fixed"))
    }

    fn period_size(&self) -> Result<Frames, PcmError> {
        self.period_size
            .ok_or_else(|| Self::invalid("period size not fixed"))
    }

    fn commit_hw_params(&mut self) -> Result<(), PcmError> {
        self.record(SimOp::CommitHw)?;
        if self.access.is_none() || self.format.is_none() || self.channels.is_none() {
            return Err(Self::invalid("incomplete configuration"));
        }
        if self.rate.is_none() {
            self.rate = self.caps.rates.first().copied();
        }
        let period_size = self
            .period_size
            .unwrap_or(self.caps.default_period_size);
        let buffer_size = self
            .buffer_size
            .unwrap_or(self.caps.default_buffer_size)
            .max(period_size);
        self.period_size = Some(period_size);
        self.buffer_size = Some(buffer_size);
        self.committed = true;
        self.build_ring();
        self.appl_ptr = 0;
        self.hw_ptr = 0;
        self.state = PcmState::Prepared;
        Ok(())
    }

    fn boundary(&self) -> Result<Frames, PcmError> {
        let buffer_size = self.buffer_size()?;
        let mut boundary = buffer_size;
        while let Some(next) = boundary.checked_mul(2) {
            if next > (i64::MAX as Frames) - buffer_size {
                break;
            }
            boundary = next;
        }
        Ok(boundary)
    }

    fn commit_sw_params(&mut self, params: &SwParams) -> Result<(), PcmError> {
        self.record(SimOp::CommitSw)?;
        if !self.committed {
            return Err(PcmError::backend(-EBADFD, "hardware params not set"));
        }
        self.sw_params = Some(*params);
        Ok(())
    }

    fn state(&self) -> PcmState {
        self.state
    }

    fn avail_update(&mut self) -> Result<Frames, PcmError> {
        self.record(SimOp::AvailUpdate)?;
        self.status_error()?;
        Ok(self.buffer_size.unwrap_or(0) - self.queued())
    }

    fn start(&mut self) -> Result<(), PcmError> {
        self.record(SimOp::Start)?;
        if self.state != PcmState::Prepared {
            return Err(PcmError::backend(-EBADFD, "File descriptor in bad state"));
        }
        self.state = PcmState::Running;
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), PcmError> {
        self.record(SimOp::Prepare)?;
        if self.state == PcmState::Disconnected {
            return Err(PcmError::Disconnected);
        }
        self.appl_ptr = 0;
        self.hw_ptr = 0;
        self.state = PcmState::Prepared;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PcmError> {
        self.record(SimOp::Resume)?;
        if self.state != PcmState::Suspended {
            return Err(PcmError::backend(-EBADFD, "File descriptor in bad state"));
        }
        self.state = self.state_before_suspend;
        Ok(())
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> Result<bool, PcmError> {
        self.record(SimOp::Wait)?;
        self.status_error()?;
        if self.drain_on_wait {
            let period = self.period_size.unwrap_or(0);
            self.play(period);
        }
        Ok(true)
    }

    fn mmap_begin(&mut self, frames: Frames) -> Result<MmapGrant, PcmError> {
        self.record(SimOp::MmapBegin)?;
        self.status_error()?;
        let buffer_size = self.buffer_size.unwrap_or(0);
        let offset = (self.appl_ptr % buffer_size.max(1) as u64) as Frames;
        let avail = buffer_size - self.queued();
        let mut granted = frames.min(avail).min(buffer_size - offset);
        if let Some(limit) = self.grant_limit {
            granted = granted.min(limit);
        }
        granted += self.grant_excess;
        Ok(MmapGrant {
            areas: self.layout(),
            offset,
            frames: granted,
        })
    }

    fn mapped_mut(&mut self) -> Vec<&mut [u8]> {
        self.ring.iter_mut().map(Vec::as_mut_slice).collect()
    }

    fn mmap_commit(&mut self, offset: Frames, frames: Frames) -> Result<Frames, PcmError> {
        self.record(SimOp::MmapCommit)?;
        self.status_error()?;
        let buffer_size = self.buffer_size.unwrap_or(0);
        if offset != (self.appl_ptr % buffer_size.max(1) as u64) as Frames {
            return Err(PcmError::backend(-EINVAL, "commit offset mismatch"));
        }
        let accepted = match self.commit_truncation.pop_front() {
            Some(limit) => frames.min(limit),
            None => frames,
        };
        self.appl_ptr += accepted as u64;
        self.total_committed += accepted as u64;

        if let (PcmState::Prepared, Some(sw)) = (self.state, self.sw_params) {
            if accepted > 0 && self.queued() >= sw.start_threshold {
                self.state = PcmState::Running;
            }
        }
        Ok(accepted)
    }
}

impl Drop for SimulatedPcm {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
