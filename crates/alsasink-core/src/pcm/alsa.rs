//! libasound playback backend
//!
//! Thin wrapper over the ALSA PCM C API via `alsa-sys`. Every call that can
//! fail goes through [`check`], which maps the negative errno convention onto
//! [`PcmError`]. The ring buffer is exposed as byte slices, one per disjoint
//! run of channel memory, so the writer never touches raw pointers.

use super::{ChannelArea, Frames, MmapGrant, PcmDevice, PcmError, PcmState, SwParams};
use crate::format::{Access, FormatDescriptor, SampleFormat};
use alsa_sys as sys;
use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_uint};
use std::ptr;
use std::time::Duration;

const EAGAIN: c_int = 11;
const ENODEV: c_int = 19;
const EINVAL: c_int = 22;
const EPIPE: c_int = 32;
const ESTRPIPE: c_int = 86;

/// Human readable message for a negative ALSA return code
fn strerror(err: c_int) -> String {
    // SAFETY: snd_strerror returns a pointer to a static string
    unsafe {
        let msg = sys::snd_strerror(err);
        if msg.is_null() {
            return format!("error {}", err);
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

/// Map a libasound return code onto a result
fn check(ret: c_int) -> Result<c_int, PcmError> {
    match ret {
        r if r >= 0 => Ok(r),
        r if r == -EPIPE => Err(PcmError::Xrun),
        r if r == -ESTRPIPE => Err(PcmError::Suspended),
        r if r == -EAGAIN => Err(PcmError::Again),
        r if r == -ENODEV => Err(PcmError::Disconnected),
        r => Err(PcmError::backend(r, strerror(r))),
    }
}

fn check_frames(ret: sys::snd_pcm_sframes_t) -> Result<Frames, PcmError> {
    if ret < 0 {
        check(ret as c_int).map(|_| 0)
    } else {
        Ok(ret as Frames)
    }
}

fn access_code(access: Access) -> sys::snd_pcm_access_t {
    match access {
        Access::MmapInterleaved => sys::SND_PCM_ACCESS_MMAP_INTERLEAVED,
        Access::MmapNoninterleaved => sys::SND_PCM_ACCESS_MMAP_NONINTERLEAVED,
        Access::MmapComplex => sys::SND_PCM_ACCESS_MMAP_COMPLEX,
    }
}

fn format_code(format: SampleFormat) -> sys::snd_pcm_format_t {
    match format {
        SampleFormat::S8 => sys::SND_PCM_FORMAT_S8,
        SampleFormat::U8 => sys::SND_PCM_FORMAT_U8,
        SampleFormat::S16Le => sys::SND_PCM_FORMAT_S16_LE,
        SampleFormat::S16Be => sys::SND_PCM_FORMAT_S16_BE,
        SampleFormat::U16Le => sys::SND_PCM_FORMAT_U16_LE,
        SampleFormat::U16Be => sys::SND_PCM_FORMAT_U16_BE,
        SampleFormat::S24Le => sys::SND_PCM_FORMAT_S24_LE,
        SampleFormat::S24Be => sys::SND_PCM_FORMAT_S24_BE,
        SampleFormat::U24Le => sys::SND_PCM_FORMAT_U24_LE,
        SampleFormat::U24Be => sys::SND_PCM_FORMAT_U24_BE,
        SampleFormat::S24PackedLe => sys::SND_PCM_FORMAT_S24_3LE,
        SampleFormat::S24PackedBe => sys::SND_PCM_FORMAT_S24_3BE,
        SampleFormat::U24PackedLe => sys::SND_PCM_FORMAT_U24_3LE,
        SampleFormat::U24PackedBe => sys::SND_PCM_FORMAT_U24_3BE,
        SampleFormat::S32Le => sys::SND_PCM_FORMAT_S32_LE,
        SampleFormat::S32Be => sys::SND_PCM_FORMAT_S32_BE,
        SampleFormat::U32Le => sys::SND_PCM_FORMAT_U32_LE,
        SampleFormat::U32Be => sys::SND_PCM_FORMAT_U32_BE,
    }
}

/// Contiguous run of mapped memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    addr: *mut u8,
    len: usize,
}

impl Segment {
    fn end(&self) -> usize {
        self.addr as usize + self.len
    }
}

/// Split channel areas into disjoint segments
///
/// Each channel covers the bytes from its area address to the end of its
/// last sample in the ring. Overlapping channels (interleaved buffers, or
/// non-interleaved ones sharing a base address) lie in the same allocation
/// and are merged. Channels that merely touch stay apart, since plugin
/// devices may hand out one allocation per channel.
fn segments(
    raw: &[sys::snd_pcm_channel_area_t],
    buffer_size: Frames,
    sample_bytes: usize,
) -> (Vec<Segment>, Vec<ChannelArea>) {
    let spans: Vec<Segment> = raw
        .iter()
        .map(|a| {
            let last_bit = a.first as usize + buffer_size.saturating_sub(1) * a.step as usize;
            Segment {
                addr: a.addr as *mut u8,
                len: last_bit / 8 + sample_bytes,
            }
        })
        .collect();

    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by_key(|&i| spans[i].addr as usize);

    let mut merged: Vec<Segment> = Vec::new();
    let mut owner = vec![0; spans.len()];
    for i in order {
        let span = spans[i];
        match merged.last_mut() {
            Some(seg) if (span.addr as usize) < seg.end() => {
                seg.len = seg.len.max(span.end() - seg.addr as usize);
            }
            _ => merged.push(span),
        }
        owner[i] = merged.len() - 1;
    }

    let areas = raw
        .iter()
        .zip(&spans)
        .zip(&owner)
        .map(|((a, span), &segment)| ChannelArea {
            segment,
            base: span.addr as usize - merged[segment].addr as usize,
            first: a.first,
            step: a.step,
        })
        .collect();
    (merged, areas)
}

/// Playback stream opened through libasound
#[derive(Debug)]
pub struct AlsaPcm {
    name: String,
    handle: *mut sys::snd_pcm_t,
    hw: *mut sys::snd_pcm_hw_params_t,
    sw: *mut sys::snd_pcm_sw_params_t,
    /// Physical bytes per sample of the configured format
    sample_bytes: usize,
    /// Buffer size of the committed configuration
    buffer_size: Frames,
    /// Disjoint memory runs reported by the last mmap_begin
    mapping: Vec<Segment>,
}

impl AlsaPcm {
    /// Open `name` for playback in blocking mode
    pub fn open(name: &str) -> Result<Self, PcmError> {
        let c_name = CString::new(name)
            .map_err(|_| PcmError::backend(-EINVAL, "device name contains a NUL byte"))?;

        let mut handle = ptr::null_mut();
        // SAFETY: out-pointer is valid, name is a NUL terminated string
        check(unsafe {
            sys::snd_pcm_open(&mut handle, c_name.as_ptr(), sys::SND_PCM_STREAM_PLAYBACK, 0)
        })?;

        let mut pcm = Self {
            name: name.to_string(),
            handle,
            hw: ptr::null_mut(),
            sw: ptr::null_mut(),
            sample_bytes: 0,
            buffer_size: 0,
            mapping: Vec::new(),
        };
        // SAFETY: out-pointer is valid; Drop frees it if allocated
        check(unsafe { sys::snd_pcm_hw_params_malloc(&mut pcm.hw) })?;
        // SAFETY: as above
        check(unsafe { sys::snd_pcm_sw_params_malloc(&mut pcm.sw) })?;
        tracing::debug!("Opened ALSA device {}", name);
        Ok(pcm)
    }

    fn map_areas(
        &mut self,
        areas: *const sys::snd_pcm_channel_area_t,
        channels: usize,
    ) -> Vec<ChannelArea> {
        if areas.is_null() {
            self.mapping.clear();
            return Vec::new();
        }
        // SAFETY: mmap_begin returned a non-null array with one area per channel
        let raw = unsafe { std::slice::from_raw_parts(areas, channels) };
        let (mapping, mapped) = segments(raw, self.buffer_size, self.sample_bytes);
        if mapping.iter().any(|seg| seg.addr.is_null()) {
            self.mapping.clear();
        } else {
            self.mapping = mapping;
        }
        mapped
    }

    fn channels(&self) -> Result<usize, PcmError> {
        let mut channels: c_uint = 0;
        // SAFETY: hw holds the committed configuration
        check(unsafe { sys::snd_pcm_hw_params_get_channels(self.hw, &mut channels) })?;
        Ok(channels as usize)
    }
}

impl PcmDevice for AlsaPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn hw_params_any(&mut self) -> Result<(), PcmError> {
        // SAFETY: handle and hw are valid for the lifetime of self
        check(unsafe { sys::snd_pcm_hw_params_any(self.handle, self.hw) }).map(|_| ())
    }

    fn set_access(&mut self, access: Access) -> Result<(), PcmError> {
        // SAFETY: handle and hw are valid for the lifetime of self
        check(unsafe { sys::snd_pcm_hw_params_set_access(self.handle, self.hw, access_code(access)) })
            .map(|_| ())
    }

    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError> {
        // SAFETY: handle and hw are valid for the lifetime of self
        check(unsafe { sys::snd_pcm_hw_params_set_format(self.handle, self.hw, format_code(format)) })?;
        self.sample_bytes = FormatDescriptor::new(format).physical_bytes();
        Ok(())
    }

    fn set_channels(&mut self, channels: u32) -> Result<(), PcmError> {
        // SAFETY: handle and hw are valid for the lifetime of self
        check(unsafe { sys::snd_pcm_hw_params_set_channels(self.handle, self.hw, channels) })
            .map(|_| ())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError> {
        let mut rate: c_uint = rate;
        let mut dir: c_int = 0;
        // SAFETY: handle and hw are valid; rate and dir are live locals
        check(unsafe {
            sys::snd_pcm_hw_params_set_rate_near(self.handle, self.hw, &mut rate, &mut dir)
        })?;
        Ok(rate)
    }

    fn set_buffer_time_near(&mut self, buffer_time_us: u32) -> Result<u32, PcmError> {
        let mut time: c_uint = buffer_time_us;
        let mut dir: c_int = 0;
        // SAFETY: handle and hw are valid; time and dir are live locals
        check(unsafe {
            sys::snd_pcm_hw_params_set_buffer_time_near(self.handle, self.hw, &mut time, &mut dir)
        })?;
        Ok(time)
    }

    fn set_period_time_near(&mut self, period_time_us: u32) -> Result<u32, PcmError> {
        let mut time: c_uint = period_time_us;
        let mut dir: c_int = 0;
        // SAFETY: handle and hw are valid; time and dir are live locals
        check(unsafe {
            sys::snd_pcm_hw_params_set_period_time_near(self.handle, self.hw, &mut time, &mut dir)
        })?;
        Ok(time)
    }

    fn buffer_size(&self) -> Result<Frames, PcmError> {
        let mut size: sys::snd_pcm_uframes_t = 0;
        // SAFETY: hw is valid; size is a live local
        check(unsafe { sys::snd_pcm_hw_params_get_buffer_size(self.hw, &mut size) })?;
        Ok(size as Frames)
    }

    fn period_size(&self) -> Result<Frames, PcmError> {
        let mut size: sys::snd_pcm_uframes_t = 0;
        let mut dir: c_int = 0;
        // SAFETY: hw is valid; size and dir are live locals
        check(unsafe { sys::snd_pcm_hw_params_get_period_size(self.hw, &mut size, &mut dir) })?;
        Ok(size as Frames)
    }

    fn commit_hw_params(&mut self) -> Result<(), PcmError> {
        // SAFETY: handle and hw are valid for the lifetime of self
        check(unsafe { sys::snd_pcm_hw_params(self.handle, self.hw) })?;
        self.buffer_size = self.buffer_size()?;
        self.mapping.clear();
        Ok(())
    }

    fn boundary(&self) -> Result<Frames, PcmError> {
        let mut boundary: sys::snd_pcm_uframes_t = 0;
        // SAFETY: sw is owned by self; loading the current params only writes into it
        check(unsafe { sys::snd_pcm_sw_params_current(self.handle, self.sw) })?;
        // SAFETY: sw was just filled; boundary is a live local
        check(unsafe { sys::snd_pcm_sw_params_get_boundary(self.sw, &mut boundary) })?;
        Ok(boundary as Frames)
    }

    fn commit_sw_params(&mut self, params: &SwParams) -> Result<(), PcmError> {
        // SAFETY: handle and sw are valid for the lifetime of self and every
        // call only reads or writes the owned sw container
        unsafe {
            check(sys::snd_pcm_sw_params_current(self.handle, self.sw))?;
            check(sys::snd_pcm_sw_params_set_start_threshold(
                self.handle,
                self.sw,
                params.start_threshold as sys::snd_pcm_uframes_t,
            ))?;
            check(sys::snd_pcm_sw_params_set_avail_min(
                self.handle,
                self.sw,
                params.avail_min as sys::snd_pcm_uframes_t,
            ))?;
            check(sys::snd_pcm_sw_params_set_stop_threshold(
                self.handle,
                self.sw,
                params.stop_threshold as sys::snd_pcm_uframes_t,
            ))?;
            if params.period_event {
                check(sys::snd_pcm_sw_params_set_period_event(self.handle, self.sw, 1))?;
            }
            check(sys::snd_pcm_sw_params(self.handle, self.sw))?;
        }
        Ok(())
    }

    fn state(&self) -> PcmState {
        // SAFETY: handle is open for the lifetime of self
        match unsafe { sys::snd_pcm_state(self.handle) } {
            sys::SND_PCM_STATE_OPEN => PcmState::Open,
            sys::SND_PCM_STATE_SETUP => PcmState::Setup,
            sys::SND_PCM_STATE_PREPARED => PcmState::Prepared,
            sys::SND_PCM_STATE_RUNNING => PcmState::Running,
            sys::SND_PCM_STATE_XRUN => PcmState::Xrun,
            sys::SND_PCM_STATE_DRAINING => PcmState::Draining,
            sys::SND_PCM_STATE_PAUSED => PcmState::Paused,
            sys::SND_PCM_STATE_SUSPENDED => PcmState::Suspended,
            _ => PcmState::Disconnected,
        }
    }

    fn avail_update(&mut self) -> Result<Frames, PcmError> {
        // SAFETY: handle is open for the lifetime of self
        check_frames(unsafe { sys::snd_pcm_avail_update(self.handle) })
    }

    fn start(&mut self) -> Result<(), PcmError> {
        // SAFETY: handle is open for the lifetime of self
        check(unsafe { sys::snd_pcm_start(self.handle) }).map(|_| ())
    }

    fn prepare(&mut self) -> Result<(), PcmError> {
        // SAFETY: handle is open for the lifetime of self
        check(unsafe { sys::snd_pcm_prepare(self.handle) }).map(|_| ())
    }

    fn resume(&mut self) -> Result<(), PcmError> {
        // SAFETY: handle is open for the lifetime of self
        check(unsafe { sys::snd_pcm_resume(self.handle) }).map(|_| ())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, PcmError> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(c_int::MAX as u128) as c_int,
            None => -1,
        };
        // SAFETY: handle is open for the lifetime of self
        check(unsafe { sys::snd_pcm_wait(self.handle, timeout_ms) }).map(|ready| ready > 0)
    }

    fn mmap_begin(&mut self, frames: Frames) -> Result<MmapGrant, PcmError> {
        let mut areas: *const sys::snd_pcm_channel_area_t = ptr::null();
        let mut offset: sys::snd_pcm_uframes_t = 0;
        let mut granted = frames as sys::snd_pcm_uframes_t;
        // SAFETY: handle is open; the out-pointers are live locals
        check(unsafe {
            sys::snd_pcm_mmap_begin(self.handle, &mut areas, &mut offset, &mut granted)
        })?;
        let channels = self.channels()?;
        let areas = self.map_areas(areas, channels);
        Ok(MmapGrant {
            areas,
            offset: offset as Frames,
            frames: granted as Frames,
        })
    }

    fn mapped_mut(&mut self) -> Vec<&mut [u8]> {
        self.mapping
            .iter()
            // SAFETY: each segment is a non-null run of channel memory
            // reported by the last mmap_begin, which stays mapped until hw
            // params change; segments never overlap, and the slices borrow
            // self mutably so no second view can exist
            .map(|seg| unsafe { std::slice::from_raw_parts_mut(seg.addr, seg.len) })
            .collect()
    }

    fn mmap_commit(&mut self, offset: Frames, frames: Frames) -> Result<Frames, PcmError> {
        // SAFETY: handle is open for the lifetime of self
        check_frames(unsafe {
            sys::snd_pcm_mmap_commit(
                self.handle,
                offset as sys::snd_pcm_uframes_t,
                frames as sys::snd_pcm_uframes_t,
            )
        })
    }
}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        // SAFETY: each pointer was allocated by libasound and is freed once
        unsafe {
            if !self.sw.is_null() {
                sys::snd_pcm_sw_params_free(self.sw);
            }
            if !self.hw.is_null() {
                sys::snd_pcm_hw_params_free(self.hw);
            }
            if !self.handle.is_null() {
                sys::snd_pcm_close(self.handle);
            }
        }
        tracing::debug!("Closed ALSA device {}", self.name);
    }
}
