//! The per-context buffer cache.
//!
//! Buffers are decoded audio resources keyed by name. The cache is an
//! ordered map keyed by `(hash(name), name)` — ordering primarily by the
//! hash keeps lookups cheap while the name tiebreak makes hash collisions
//! harmless. Synchronous loads decode on the calling thread; asynchronous
//! loads allocate the backend buffer up front, enqueue a pending-decode
//! record for the worker, and hand back a [`FutureBuffer`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex};

use crate::backend::{
    frames_to_bytes, BackendFormat, ChannelConfig, Extension, RawBuffer, SampleType,
};
use crate::context::Context;
use crate::decoder::Decoder;
use crate::error::{FernSonicError, Result};
use crate::handle::Handle;
use crate::source::Source;

pub(crate) type BufferHandle = Handle<BufferEntry>;

/// Cache key: hash first, name as the collision tiebreak.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BufferKey {
    pub hash: u64,
    pub name: String,
}

impl BufferKey {
    pub fn new(name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            name: name.to_string(),
        }
    }
}

/// Load progress of a cached buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Pending,
    Ready,
    Failed(FernSonicError),
}

/// Shared Pending → Ready/Failed cell. The cache entry, the worker, and
/// every future clone hold the same allocation; the transition away from
/// `Pending` happens exactly once and wakes all waiters.
pub(crate) struct LoadState {
    status: Mutex<LoadStatus>,
    cond: Condvar,
}

impl LoadState {
    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(LoadStatus::Pending),
            cond: Condvar::new(),
        })
    }

    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(LoadStatus::Ready),
            cond: Condvar::new(),
        })
    }

    pub fn settle(&self, status: LoadStatus) {
        debug_assert!(!matches!(status, LoadStatus::Pending));
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*guard, LoadStatus::Pending) {
            *guard = status;
        }
        self.cond.notify_all();
    }

    pub fn status(&self) -> LoadStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Blocks until the load settles; `Err` re-raises a recorded failure.
    pub fn wait(&self) -> Result<()> {
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        while matches!(*guard, LoadStatus::Pending) {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        match &*guard {
            LoadStatus::Ready => Ok(()),
            LoadStatus::Failed(err) => Err(err.clone()),
            LoadStatus::Pending => unreachable!(),
        }
    }

    /// Non-blocking readiness check.
    pub fn poll(&self) -> Option<Result<()>> {
        match self.status() {
            LoadStatus::Pending => None,
            LoadStatus::Ready => Some(Ok(())),
            LoadStatus::Failed(err) => Some(Err(err)),
        }
    }
}

/// A cached buffer.
pub(crate) struct BufferEntry {
    pub name: String,
    pub raw: RawBuffer,
    pub frequency: u32,
    pub channels: ChannelConfig,
    pub sample_type: SampleType,
    /// Length in sample frames. For a still-pending async load this is the
    /// decoder's declared length; the decode result overwrites it.
    pub frames: u64,
    pub loop_points: (u64, u64),
    pub load: Arc<LoadState>,
    /// Sources currently playing this buffer. Non-zero blocks removal.
    pub source_refs: u32,
}

/// Clamps decoder-reported loop points to `[0, frames)` semantics.
pub(crate) fn normalize_loop_points(points: (u64, u64), frames: u64) -> (u64, u64) {
    let (start, end) = points;
    if start >= end {
        (0, frames)
    } else {
        let end = end.min(frames);
        (start.min(end.saturating_sub(1)), end)
    }
}

/// Maps a channel/sample-type pair to an uploadable format, honoring the
/// extension set the backend advertised.
pub(crate) fn select_format(
    channels: ChannelConfig,
    sample_type: SampleType,
    has_ext: impl Fn(Extension) -> bool,
) -> Result<BackendFormat> {
    let unsupported = || {
        Err(FernSonicError::FormatUnsupported(format!(
            "{} {}",
            channels.name(),
            sample_type.name()
        )))
    };

    let multi = matches!(
        channels,
        ChannelConfig::Rear
            | ChannelConfig::Quad
            | ChannelConfig::X51
            | ChannelConfig::X61
            | ChannelConfig::X71
    );
    let bformat = matches!(channels, ChannelConfig::BFormat2D | ChannelConfig::BFormat3D);

    match sample_type {
        SampleType::UInt8 | SampleType::Int16 => {
            if multi && !has_ext(Extension::MultiChannelFormats) {
                return unsupported();
            }
            if bformat && !has_ext(Extension::BFormat) {
                return unsupported();
            }
        }
        SampleType::Float32 => {
            if !has_ext(Extension::Float32) {
                return unsupported();
            }
            if multi && !has_ext(Extension::MultiChannelFormats) {
                return unsupported();
            }
            if bformat && !has_ext(Extension::BFormat) {
                return unsupported();
            }
        }
        SampleType::Mulaw => {
            if multi {
                if !has_ext(Extension::MulawMultiChannel) {
                    return unsupported();
                }
            } else if bformat {
                if !has_ext(Extension::MulawBFormat) {
                    return unsupported();
                }
            } else if !has_ext(Extension::Mulaw) {
                return unsupported();
            }
        }
    }

    Ok(BackendFormat {
        channels,
        sample_type,
    })
}

/// Fully drains a decoder into an interleaved byte vector.
///
/// Returns the data and the actual frame count, which may be shorter than
/// the decoder declared.
pub(crate) fn decode_all(
    decoder: &mut dyn Decoder,
    declared_frames: u64,
) -> Result<(Vec<u8>, u64)> {
    let channels = decoder.channel_config();
    let sample_type = decoder.sample_type();
    let mut data = vec![0u8; frames_to_bytes(declared_frames, channels, sample_type) as usize];

    let frame_bytes = frames_to_bytes(1, channels, sample_type) as usize;
    let mut done: u64 = 0;
    while done < declared_frames {
        let want = (declared_frames - done).min(u32::MAX as u64) as u32;
        let got = decoder.read(&mut data[done as usize * frame_bytes..], want);
        if got == 0 {
            break;
        }
        done += u64::from(got);
    }
    if done == 0 {
        return Err(FernSonicError::Decode("no samples for buffer".into()));
    }
    data.truncate(done as usize * frame_bytes);
    Ok((data, done))
}

/// Non-owning reference to a cached buffer.
#[derive(Clone)]
pub struct Buffer {
    pub(crate) ctx: Context,
    pub(crate) handle: BufferHandle,
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.ctx == other.ctx
    }
}
impl Eq for Buffer {}

impl Buffer {
    /// Length in sample frames.
    pub fn length(&self) -> Result<u64> {
        self.ctx.with_buffer(self.handle, |e| e.frames)
    }

    /// Sample rate in hz.
    pub fn frequency(&self) -> Result<u32> {
        self.ctx.with_buffer(self.handle, |e| e.frequency)
    }

    pub fn channel_config(&self) -> Result<ChannelConfig> {
        self.ctx.with_buffer(self.handle, |e| e.channels)
    }

    pub fn sample_type(&self) -> Result<SampleType> {
        self.ctx.with_buffer(self.handle, |e| e.sample_type)
    }

    /// Storage size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.ctx
            .with_buffer(self.handle, |e| frames_to_bytes(e.frames, e.channels, e.sample_type))
    }

    pub fn name(&self) -> Result<String> {
        self.ctx.with_buffer(self.handle, |e| e.name.clone())
    }

    pub fn loop_points(&self) -> Result<(u64, u64)> {
        self.ctx.with_buffer(self.handle, |e| e.loop_points)
    }

    /// Sets `[start, end)` loop points in frames. The buffer must not be in
    /// use, and without the loop-points capability only the full range is
    /// accepted.
    pub fn set_loop_points(&self, start: u64, end: u64) -> Result<()> {
        self.ctx.buffer_set_loop_points(self.handle, start, end)
    }

    pub fn load_status(&self) -> Result<LoadStatus> {
        self.ctx.with_buffer(self.handle, |e| e.load.status())
    }

    /// Sources currently playing this buffer, computed by scanning the
    /// source pool.
    pub fn sources(&self) -> Result<Vec<Source>> {
        self.ctx.buffer_sources(self.handle)
    }

    pub fn is_in_use(&self) -> Result<bool> {
        self.ctx.with_buffer(self.handle, |e| e.source_refs > 0)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("handle", &self.handle).finish()
    }
}

/// A buffer that may still be loading on the worker.
///
/// All futures for the same name resolve to the same [`Buffer`]; cloning is
/// cheap and shares the load state.
#[derive(Clone)]
pub struct FutureBuffer {
    pub(crate) ctx: Context,
    pub(crate) handle: BufferHandle,
    pub(crate) load: Arc<LoadState>,
}

impl std::fmt::Debug for FutureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureBuffer").field("handle", &self.handle).finish()
    }
}

impl FutureBuffer {
    /// Non-blocking: `None` while the load is in flight.
    pub fn poll(&self) -> Option<Result<Buffer>> {
        self.load.poll().map(|r| {
            r.map(|()| Buffer {
                ctx: self.ctx.clone(),
                handle: self.handle,
            })
        })
    }

    /// Blocks until the load settles, re-raising a recorded failure.
    pub fn wait(&self) -> Result<Buffer> {
        self.load.wait()?;
        Ok(Buffer {
            ctx: self.ctx.clone(),
            handle: self.handle,
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.load.status(), LoadStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_exts(_e: Extension) -> bool {
        true
    }
    fn no_exts(_e: Extension) -> bool {
        false
    }

    #[test]
    fn loop_point_normalization() {
        assert_eq!(normalize_loop_points((5, 5), 100), (0, 100));
        assert_eq!(normalize_loop_points((9, 3), 100), (0, 100));
        assert_eq!(normalize_loop_points((10, 400), 100), (10, 100));
        assert_eq!(normalize_loop_points((250, 400), 300), (250, 300));
        assert_eq!(normalize_loop_points((0, 50), 100), (0, 50));
    }

    #[test]
    fn format_table_respects_extensions() {
        assert!(select_format(ChannelConfig::Mono, SampleType::Int16, no_exts).is_ok());
        assert!(select_format(ChannelConfig::Stereo, SampleType::UInt8, no_exts).is_ok());
        assert!(select_format(ChannelConfig::Quad, SampleType::Int16, no_exts).is_err());
        assert!(select_format(ChannelConfig::Quad, SampleType::Int16, all_exts).is_ok());
        assert!(select_format(ChannelConfig::Mono, SampleType::Float32, no_exts).is_err());
        assert!(select_format(ChannelConfig::BFormat3D, SampleType::Mulaw, all_exts).is_ok());
        assert!(
            select_format(ChannelConfig::BFormat3D, SampleType::Mulaw, |e| e
                != Extension::MulawBFormat)
            .is_err()
        );
    }

    #[test]
    fn buffer_keys_order_by_hash_then_name() {
        let a = BufferKey::new("kick.wav");
        let b = BufferKey::new("kick.wav");
        assert_eq!(a, b);
        let c = BufferKey::new("snare.wav");
        assert_ne!(a, c);
    }

    #[test]
    fn load_state_settles_once() {
        let load = LoadState::pending();
        assert!(load.poll().is_none());
        load.settle(LoadStatus::Ready);
        load.settle(LoadStatus::Failed(FernSonicError::Decode("late".into())));
        assert_eq!(load.poll(), Some(Ok(())));
        assert!(load.wait().is_ok());
    }
}
