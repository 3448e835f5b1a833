//! Logical sound sources and the backend voice pool.
//!
//! Sources are plentiful arena slots; backend voices are finite and leased
//! only while a source is audible. When the pool runs dry, the
//! lowest-priority playing source below the requester's priority is evicted
//! (and its owner notified). Streaming sources queue decoded chunks on their
//! voice and are refilled by the context worker.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::backend::{
    frames_to_bytes, BackendContext, BackendFormat, Extension, FilterParams, RawBuffer, RawVoice,
    Spatialize, VoiceParamF, VoiceParamI, VoiceParamV, VoiceState,
};
use crate::buffer::{normalize_loop_points, select_format, Buffer, BufferHandle, FutureBuffer,
    LoadState, LoadStatus};
use crate::context::{Context, ContextInner, ContextMessage, ContextState};
use crate::decoder::Decoder;
use crate::effect::{AuxiliaryEffectSlot, SlotHandle};
use crate::error::{FernSonicError, Result};
use crate::group::{GroupHandle, SourceGroup};
use crate::handle::Handle;
use crate::math::{Orientation, Vec3};

pub(crate) type SourceHandle = Handle<SourceEntry>;

/// One auxiliary output of a source.
#[derive(Clone)]
pub(crate) struct SendState {
    pub slot: Option<SlotHandle>,
    pub filter: FilterParams,
}

impl Default for SendState {
    fn default() -> Self {
        Self {
            slot: None,
            filter: FilterParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Playback {
    Detached,
    Buffer,
    Streaming,
    Pending,
    PausedBuffer,
    PausedStreaming,
}

/// Per-source streaming machinery, alive while the source streams.
pub(crate) struct StreamState {
    pub decoder: Box<dyn Decoder>,
    pub chunk_frames: u32,
    pub format: BackendFormat,
    pub frequency: u32,
    /// All scratch buffers owned by this stream.
    pub bufs: Vec<RawBuffer>,
    /// Scratch buffers not currently queued on the voice.
    pub idle: Vec<RawBuffer>,
    pub queued: u32,
    /// Frame count uploaded into each queued scratch buffer.
    pub filled: HashMap<RawBuffer, u32>,
    /// Frames fully consumed by the voice.
    pub frames_played: u64,
    pub done_reading: bool,
    pub loop_start: u64,
}

pub(crate) struct FadeState {
    pub start: Instant,
    pub duration: Duration,
    pub target: f32,
}

impl FadeState {
    /// Linear gain multiplier: 1.0 at the start, `target` at completion.
    pub fn multiplier(&self, now: Instant) -> f32 {
        let t = now.duration_since(self.start).as_secs_f32() / self.duration.as_secs_f32();
        if t >= 1.0 {
            self.target
        } else {
            1.0 + (self.target - 1.0) * t
        }
    }
}

pub(crate) struct PendingPlay {
    pub handle: BufferHandle,
    pub load: std::sync::Arc<LoadState>,
}

pub(crate) struct SourceEntry {
    pub voice: Option<RawVoice>,
    pub playback: Playback,
    pub buffer: Option<BufferHandle>,
    pub stream: Option<StreamState>,
    pub pending: Option<PendingPlay>,
    pub fade: Option<FadeState>,

    pub priority: u32,
    pub looping: bool,
    /// Start offset for the next play, in frames.
    pub offset: u64,

    pub gain: f32,
    pub pitch: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    pub orientation: Option<Orientation>,
    pub cone_inner: f32,
    pub cone_outer: f32,
    pub outer_gain: f32,
    pub outer_gain_hf: f32,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff: f32,
    pub room_rolloff: f32,
    pub doppler: f32,
    pub relative: bool,
    pub radius: f32,
    pub stereo_angles: (f32, f32),
    pub spatialize: Spatialize,
    pub resampler_index: u32,
    pub air_absorption: f32,
    /// (direct-hf, send, send-hf) automatic gain adjustment.
    pub gain_auto: (bool, bool, bool),
    pub direct_filter: FilterParams,
    pub sends: Vec<SendState>,

    pub group: Option<GroupHandle>,
    /// Gain/pitch needs recommitting on the next update.
    pub dirty: bool,
}

impl SourceEntry {
    pub fn new(max_sends: u32) -> Self {
        Self {
            voice: None,
            playback: Playback::Detached,
            buffer: None,
            stream: None,
            pending: None,
            fade: None,
            priority: 0,
            looping: false,
            offset: 0,
            gain: 1.0,
            pitch: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            orientation: None,
            cone_inner: 360.0,
            cone_outer: 360.0,
            outer_gain: 0.0,
            outer_gain_hf: 1.0,
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff: 1.0,
            room_rolloff: 0.0,
            doppler: 1.0,
            relative: false,
            radius: 0.0,
            stereo_angles: (std::f32::consts::FRAC_PI_6, -std::f32::consts::FRAC_PI_6),
            spatialize: Spatialize::Auto,
            resampler_index: 0,
            air_absorption: 0.0,
            gain_auto: (true, true, true),
            direct_filter: FilterParams::default(),
            sends: vec![SendState::default(); max_sends as usize],
            group: None,
            dirty: false,
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.playback, Playback::Buffer | Playback::Streaming)
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self.playback,
            Playback::PausedBuffer | Playback::PausedStreaming
        )
    }
}

/// Accumulated group gain/pitch for a source, walking the parent chain.
fn group_factors(state: &ContextState, group: Option<GroupHandle>) -> (f32, f32) {
    let mut gain = 1.0;
    let mut pitch = 1.0;
    let mut cursor = group;
    while let Some(handle) = cursor {
        let Some(entry) = state.groups.get(handle) else {
            break;
        };
        gain *= entry.gain;
        pitch *= entry.pitch;
        cursor = entry.parent;
    }
    (gain, pitch)
}

/// Effective gain and pitch for a source: base × group chain × fade.
fn effective_gain_pitch(state: &ContextState, handle: SourceHandle) -> Option<(f32, f32)> {
    let entry = state.sources.get(handle)?;
    let (group_gain, group_pitch) = group_factors(state, entry.group);
    let fade = entry
        .fade
        .as_ref()
        .map(|f| f.multiplier(Instant::now()))
        .unwrap_or(1.0);
    Some((entry.gain * group_gain * fade, entry.pitch * group_pitch))
}

/// Re-sends gain and pitch to the backend voice.
pub(crate) fn commit_gain_pitch(
    inner: &ContextInner,
    state: &mut ContextState,
    handle: SourceHandle,
) {
    let Some((gain, pitch)) = effective_gain_pitch(state, handle) else {
        return;
    };
    let Some(voice) = state.sources.get(handle).and_then(|e| e.voice) else {
        return;
    };
    inner.backend.voice_set_f(voice, VoiceParamF::Gain, gain);
    inner.backend.voice_set_f(voice, VoiceParamF::Pitch, pitch);
}

/// Pushes the source's entire property block to its voice. Called when a
/// voice is (re)leased, before playback starts.
fn commit_full(inner: &ContextInner, state: &mut ContextState, handle: SourceHandle) {
    let Some((gain, pitch)) = effective_gain_pitch(state, handle) else {
        return;
    };
    // Resolve send targets before borrowing the entry.
    let send_raws: Vec<Option<crate::backend::RawSlot>> = {
        let Some(entry) = state.sources.get(handle) else {
            return;
        };
        entry
            .sends
            .iter()
            .map(|s| s.slot.and_then(|sh| state.slots.get(sh)).map(|se| se.raw))
            .collect()
    };
    let Some(entry) = state.sources.get(handle) else {
        return;
    };
    let Some(voice) = entry.voice else {
        return;
    };
    let backend = inner.backend.as_ref();

    backend.voice_set_f(voice, VoiceParamF::Gain, gain);
    backend.voice_set_f(voice, VoiceParamF::Pitch, pitch);
    backend.voice_set_f(voice, VoiceParamF::MinGain, entry.min_gain);
    backend.voice_set_f(voice, VoiceParamF::MaxGain, entry.max_gain);
    backend.voice_set_f(voice, VoiceParamF::ReferenceDistance, entry.ref_distance);
    backend.voice_set_f(voice, VoiceParamF::MaxDistance, entry.max_distance);
    backend.voice_set_f(voice, VoiceParamF::RolloffFactor, entry.rolloff);
    backend.voice_set_f(voice, VoiceParamF::RoomRolloffFactor, entry.room_rolloff);
    backend.voice_set_f(voice, VoiceParamF::DopplerFactor, entry.doppler);
    backend.voice_set_f(voice, VoiceParamF::ConeInnerAngle, entry.cone_inner);
    backend.voice_set_f(voice, VoiceParamF::ConeOuterAngle, entry.cone_outer);
    backend.voice_set_f(voice, VoiceParamF::ConeOuterGain, entry.outer_gain);
    backend.voice_set_f(voice, VoiceParamF::AirAbsorptionFactor, entry.air_absorption);
    backend.voice_set_v3(voice, VoiceParamV::Position, entry.position);
    backend.voice_set_v3(voice, VoiceParamV::Velocity, entry.velocity);
    match entry.orientation {
        Some(o) => backend.voice_set_orientation(voice, o.at, o.up),
        None => backend.voice_set_v3(voice, VoiceParamV::Direction, entry.direction),
    }
    backend.voice_set_i(voice, VoiceParamI::Relative, entry.relative as i32);
    // Static buffers loop on the backend; streams loop by seeking the
    // decoder, so their voice must not.
    let backend_loop = entry.looping && entry.playback == Playback::Buffer;
    backend.voice_set_i(voice, VoiceParamI::Looping, backend_loop as i32);
    backend.voice_set_i(
        voice,
        VoiceParamI::DirectGainHFAuto,
        entry.gain_auto.0 as i32,
    );
    backend.voice_set_i(voice, VoiceParamI::SendGainAuto, entry.gain_auto.1 as i32);
    backend.voice_set_i(voice, VoiceParamI::SendGainHFAuto, entry.gain_auto.2 as i32);
    if inner.has_ext(Extension::Efx) {
        backend.voice_set_f(voice, VoiceParamF::ConeOuterGainHF, entry.outer_gain_hf);
    }
    if inner.has_ext(Extension::SourceRadius) {
        backend.voice_set_f(voice, VoiceParamF::Radius, entry.radius);
    }
    if inner.has_ext(Extension::StereoAngles) {
        backend.voice_set_stereo_angles(voice, entry.stereo_angles.0, entry.stereo_angles.1);
    }
    if inner.has_ext(Extension::SourceSpatialize) {
        let value = match entry.spatialize {
            Spatialize::Off => 0,
            Spatialize::On => 1,
            Spatialize::Auto => 2,
        };
        backend.voice_set_i(voice, VoiceParamI::Spatialize, value);
    }
    if inner.has_ext(Extension::SourceResampler) {
        backend.voice_set_i(
            voice,
            VoiceParamI::ResamplerIndex,
            entry.resampler_index as i32,
        );
    }
    backend.voice_set_direct_filter(voice, entry.direct_filter);
    if inner.has_ext(Extension::Efx) {
        for (i, (send, raw)) in entry.sends.iter().zip(send_raws).enumerate() {
            if let Err(err) = backend.voice_set_send(voice, i as u32, raw, send.filter) {
                log::debug!("send {i} not applied: {err}");
            }
        }
    }
}

/// Leases a backend voice: from the free stack, freshly generated, or by
/// evicting the lowest-priority playing source below `max_priority`.
pub(crate) fn get_voice(
    inner: &ContextInner,
    state: &mut ContextState,
    max_priority: u32,
    messages: &mut Vec<ContextMessage>,
) -> Result<RawVoice> {
    if let Some(std::cmp::Reverse(voice)) = state.free_voices.pop() {
        return Ok(voice);
    }
    if let Ok(voice) = inner.backend.gen_voice() {
        return Ok(voice);
    }

    let victim = state
        .sources
        .iter()
        .filter(|(_, e)| e.voice.is_some() && e.is_playing())
        .min_by_key(|(_, e)| e.priority)
        .map(|(h, e)| (h, e.priority));
    match victim {
        Some((handle, priority)) if priority < max_priority => {
            log::debug!("evicting source {handle:?} (priority {priority})");
            stop_playback(inner, state, handle, true, true);
            messages.push(ContextMessage::ForceStopped(handle));
        }
        _ => {
            return Err(FernSonicError::Capacity(
                "all voices busy at equal or higher priority".into(),
            ))
        }
    }
    state
        .free_voices
        .pop()
        .map(|std::cmp::Reverse(voice)| voice)
        .ok_or_else(|| FernSonicError::Capacity("eviction yielded no voice".into()))
}

/// Tears down whatever the source is doing. With `release_voice` the lease
/// returns to the free stack (the source ends Detached); without it the
/// voice stays leased for an immediate replay. Always clears any fade.
pub(crate) fn stop_playback(
    inner: &ContextInner,
    state: &mut ContextState,
    handle: SourceHandle,
    release_voice: bool,
    unlink_stream: bool,
) {
    let (voice, stream, buffer) = {
        let Some(entry) = state.sources.get_mut(handle) else {
            return;
        };
        entry.fade = None;
        entry.pending = None;
        entry.playback = Playback::Detached;
        let voice = if release_voice {
            entry.voice.take()
        } else {
            entry.voice
        };
        (voice, entry.stream.take(), entry.buffer.take())
    };

    if let Some(voice) = voice {
        let _ = inner.backend.voice_stop(voice);
        while inner.backend.voice_unqueue_buffer(voice).is_ok() {}
        let _ = inner.backend.voice_set_buffer(voice, None);
        let _ = inner.backend.voice_rewind(voice);
    }
    if let Some(stream) = stream {
        for buf in stream.bufs {
            if let Err(err) = inner.backend.delete_buffer(buf) {
                log::warn!("failed to delete stream chunk buffer: {err}");
            }
        }
        if unlink_stream {
            let mut streaming = inner.streaming.lock().unwrap_or_else(|e| e.into_inner());
            streaming.remove(&handle);
        }
    }
    if let Some(buffer) = buffer {
        if let Some(entry) = state.buffers.get_mut(buffer) {
            entry.source_refs = entry.source_refs.saturating_sub(1);
        }
    }
    if release_voice {
        if let Some(voice) = voice {
            state.free_voices.push(std::cmp::Reverse(voice));
        }
    }
}

/// Starts static-buffer playback, leasing a voice if needed. The buffer
/// must be fully loaded.
pub(crate) fn start_buffer_playback(
    inner: &ContextInner,
    state: &mut ContextState,
    handle: SourceHandle,
    buffer: BufferHandle,
    messages: &mut Vec<ContextMessage>,
) -> Result<()> {
    let (raw, frames) = {
        let entry = state
            .buffers
            .get(buffer)
            .ok_or_else(|| FernSonicError::StaleHandle("buffer was removed".into()))?;
        if !matches!(entry.load.status(), LoadStatus::Ready) {
            return Err(FernSonicError::InvalidArgument(format!(
                "buffer {:?} is not ready",
                entry.name
            )));
        }
        (entry.raw, entry.frames)
    };
    if !state.sources.contains(handle) {
        return Err(FernSonicError::StaleHandle("source was released".into()));
    }

    stop_playback(inner, state, handle, false, true);

    let priority = state.sources.get(handle).map(|e| e.priority).unwrap_or(0);
    let voice = match state.sources.get(handle).and_then(|e| e.voice) {
        Some(voice) => voice,
        None => get_voice(inner, state, priority, messages)?,
    };

    let offset = {
        let entry = state.sources.get_mut(handle).expect("source checked above");
        entry.voice = Some(voice);
        entry.buffer = Some(buffer);
        entry.playback = Playback::Buffer;
        std::mem::take(&mut entry.offset)
    };
    if let Some(entry) = state.buffers.get_mut(buffer) {
        entry.source_refs += 1;
    }

    inner.backend.voice_set_buffer(voice, Some(raw))?;
    if offset > 0 && offset < frames {
        inner
            .backend
            .voice_set_f(voice, VoiceParamF::SampleOffset, offset as f32);
    }
    commit_full(inner, state, handle);
    inner.backend.voice_play(voice)?;
    Ok(())
}

/// Reads one chunk from a streaming decoder, honoring loop points.
fn read_chunk(
    decoder: &mut dyn Decoder,
    chunk_frames: u32,
    frame_bytes: usize,
    looping: bool,
    loop_start: u64,
    data: &mut [u8],
) -> u32 {
    let mut total: u32 = 0;
    let mut zero_reads = 0;
    loop {
        let got = decoder.read(
            &mut data[total as usize * frame_bytes..],
            chunk_frames - total,
        );
        total += got;
        if total >= chunk_frames || !looping {
            break;
        }
        if got == 0 {
            zero_reads += 1;
            if zero_reads > 1 {
                break;
            }
        } else {
            zero_reads = 0;
        }
        if !decoder.seek(loop_start) {
            break;
        }
    }
    total
}

/// Starts streaming playback from a decoder.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_stream_playback(
    inner: &ContextInner,
    state: &mut ContextState,
    handle: SourceHandle,
    mut decoder: Box<dyn Decoder>,
    chunk_frames: u32,
    queue_size: u32,
    messages: &mut Vec<ContextMessage>,
) -> Result<()> {
    if !state.sources.contains(handle) {
        return Err(FernSonicError::StaleHandle("source was released".into()));
    }
    let channels = decoder.channel_config();
    let sample_type = decoder.sample_type();
    let frequency = decoder.frequency();
    let format = select_format(channels, sample_type, |e| inner.has_ext(e))?;
    let loop_points = normalize_loop_points(decoder.loop_points(), decoder.length());

    stop_playback(inner, state, handle, false, true);

    let priority = state.sources.get(handle).map(|e| e.priority).unwrap_or(0);
    let voice = match state.sources.get(handle).and_then(|e| e.voice) {
        Some(voice) => voice,
        None => get_voice(inner, state, priority, messages)?,
    };
    // From here on the voice must be released again on failure.
    let fail = |inner: &ContextInner, state: &mut ContextState, voice: RawVoice, err| {
        state.free_voices.push(std::cmp::Reverse(voice));
        if let Some(entry) = state.sources.get_mut(handle) {
            entry.voice = None;
        }
        Err(err)
    };

    inner.backend.voice_set_buffer(voice, None)?;

    let looping = state.sources.get(handle).map(|e| e.looping).unwrap_or(false);
    let frame_bytes = frames_to_bytes(1, channels, sample_type) as usize;
    let mut bufs = Vec::with_capacity(queue_size as usize);
    let mut idle = Vec::new();
    let mut filled = HashMap::new();
    let mut queued = 0u32;
    let mut done_reading = false;
    let mut data = vec![0u8; chunk_frames as usize * frame_bytes];

    for _ in 0..queue_size {
        let raw = match inner.backend.gen_buffer() {
            Ok(raw) => raw,
            Err(err) => {
                for b in &bufs {
                    let _ = inner.backend.delete_buffer(*b);
                }
                return fail(inner, state, voice, err.into());
            }
        };
        bufs.push(raw);
        if done_reading {
            idle.push(raw);
            continue;
        }
        let got = read_chunk(
            &mut *decoder,
            chunk_frames,
            frame_bytes,
            looping,
            loop_points.0,
            &mut data,
        );
        if got == 0 {
            done_reading = true;
            idle.push(raw);
            continue;
        }
        let bytes = got as usize * frame_bytes;
        if let Err(err) = inner.backend.buffer_data(raw, format, &data[..bytes], frequency) {
            for b in &bufs {
                let _ = inner.backend.delete_buffer(*b);
            }
            return fail(inner, state, voice, err.into());
        }
        if let Err(err) = inner.backend.voice_queue_buffers(voice, &[raw]) {
            for b in &bufs {
                let _ = inner.backend.delete_buffer(*b);
            }
            return fail(inner, state, voice, err.into());
        }
        filled.insert(raw, got);
        queued += 1;
    }
    if queued == 0 {
        for b in &bufs {
            let _ = inner.backend.delete_buffer(*b);
        }
        return fail(
            inner,
            state,
            voice,
            FernSonicError::Decode("no samples for stream".into()),
        );
    }

    {
        let entry = state.sources.get_mut(handle).expect("source checked above");
        entry.voice = Some(voice);
        entry.playback = Playback::Streaming;
        entry.offset = 0;
        entry.stream = Some(StreamState {
            decoder,
            chunk_frames,
            format,
            frequency,
            bufs,
            idle,
            queued,
            filled,
            frames_played: 0,
            done_reading,
            loop_start: loop_points.0,
        });
    }
    commit_full(inner, state, handle);
    inner.backend.voice_play(voice)?;

    let mut streaming = inner.streaming.lock().unwrap_or_else(|e| e.into_inner());
    streaming.insert(handle);
    Ok(())
}

/// Worker verdict for one streaming source.
pub(crate) enum StreamTick {
    Continue,
    /// Decoder drained and the queue ran out; the source is now detached.
    Finished,
    /// No longer a streaming source (stopped, released, evicted).
    Gone,
}

/// One worker pass over a streaming source: recycle processed chunks,
/// refill from the decoder, recover from under-runs, detect the natural
/// end.
pub(crate) fn update_stream(
    inner: &ContextInner,
    state: &mut ContextState,
    handle: SourceHandle,
) -> StreamTick {
    let finished = {
        let Some(entry) = state.sources.get_mut(handle) else {
            return StreamTick::Gone;
        };
        match entry.playback {
            Playback::Streaming => {}
            Playback::PausedStreaming => return StreamTick::Continue,
            _ => return StreamTick::Gone,
        }
        let Some(voice) = entry.voice else {
            return StreamTick::Gone;
        };
        let looping = entry.looping;
        let Some(stream) = entry.stream.as_mut() else {
            return StreamTick::Gone;
        };

        let frame_bytes =
            frames_to_bytes(1, stream.format.channels, stream.format.sample_type) as usize;
        let processed = inner.backend.voice_processed_count(voice);
        for _ in 0..processed {
            let Ok(raw) = inner.backend.voice_unqueue_buffer(voice) else {
                break;
            };
            stream.queued = stream.queued.saturating_sub(1);
            if let Some(frames) = stream.filled.remove(&raw) {
                stream.frames_played += u64::from(frames);
            }
            stream.idle.push(raw);
        }

        // Refill every idle chunk while the decoder still produces.
        while !stream.done_reading {
            let Some(raw) = stream.idle.pop() else {
                break;
            };
            let mut data = vec![0u8; stream.chunk_frames as usize * frame_bytes];
            let got = read_chunk(
                &mut *stream.decoder,
                stream.chunk_frames,
                frame_bytes,
                looping,
                stream.loop_start,
                &mut data,
            );
            if got == 0 {
                stream.done_reading = true;
                stream.idle.push(raw);
                break;
            }
            let bytes = got as usize * frame_bytes;
            let upload = inner
                .backend
                .buffer_data(raw, stream.format, &data[..bytes], stream.frequency)
                .and_then(|()| inner.backend.voice_queue_buffers(voice, &[raw]));
            match upload {
                Ok(()) => {
                    stream.filled.insert(raw, got);
                    stream.queued += 1;
                }
                Err(err) => {
                    log::warn!("stream refill failed: {err}");
                    stream.idle.push(raw);
                    break;
                }
            }
        }

        if inner.backend.voice_state(voice) == VoiceState::Stopped {
            if stream.queued > 0 {
                // Under-run: data is queued again, restart the voice.
                log::debug!("stream under-run on {handle:?}, restarting voice");
                let _ = inner.backend.voice_play(voice);
                false
            } else {
                stream.done_reading
            }
        } else {
            false
        }
    };

    if finished {
        // The caller removes the handle from the streaming set.
        stop_playback(inner, state, handle, true, false);
        StreamTick::Finished
    } else {
        StreamTick::Continue
    }
}

/// Foreground per-source tick: resolve future-buffer playback, advance
/// fades, reap naturally stopped voices, and flush dirty gain/pitch.
pub(crate) fn foreground_update(
    inner: &ContextInner,
    state: &mut ContextState,
    handle: SourceHandle,
    messages: &mut Vec<ContextMessage>,
) {
    // Future buffer resolution.
    let pending_poll = {
        let Some(entry) = state.sources.get(handle) else {
            return;
        };
        match (&entry.playback, &entry.pending) {
            (Playback::Pending, Some(pending)) => {
                pending.load.poll().map(|r| (pending.handle, r))
            }
            _ => None,
        }
    };
    match pending_poll {
        Some((buffer, Ok(()))) => {
            // Keep a running fade running across the transition.
            let fade = state
                .sources
                .get_mut(handle)
                .and_then(|e| e.fade.take());
            if let Err(err) = start_buffer_playback(inner, state, handle, buffer, messages) {
                log::warn!("pending playback of {handle:?} failed: {err}");
                stop_playback(inner, state, handle, true, true);
            } else if let Some(entry) = state.sources.get_mut(handle) {
                entry.fade = fade;
            }
        }
        Some((_, Err(err))) => {
            log::warn!("future buffer for {handle:?} failed: {err}");
            stop_playback(inner, state, handle, true, true);
        }
        None => {}
    }

    // Fade progression.
    let fade_done = state.sources.get(handle).and_then(|e| {
        e.fade
            .as_ref()
            .map(|f| Instant::now().duration_since(f.start) >= f.duration)
    });
    match fade_done {
        // Completion stops playback and cancels any pending future.
        Some(true) => stop_playback(inner, state, handle, true, true),
        Some(false) => {
            if let Some(entry) = state.sources.get_mut(handle) {
                entry.dirty = true;
            }
        }
        None => {}
    }

    // Natural end of static-buffer playback. Streams are reaped by the
    // worker.
    let ended = state
        .sources
        .get(handle)
        .filter(|e| e.playback == Playback::Buffer)
        .and_then(|e| e.voice)
        .map(|v| inner.backend.voice_state(v) == VoiceState::Stopped)
        .unwrap_or(false);
    if ended {
        stop_playback(inner, state, handle, true, true);
        messages.push(ContextMessage::Stopped(handle));
    }

    // Dirty gain/pitch commit.
    let dirty = state
        .sources
        .get(handle)
        .map(|e| e.dirty)
        .unwrap_or(false);
    if dirty {
        commit_gain_pitch(inner, state, handle);
        if let Some(entry) = state.sources.get_mut(handle) {
            entry.dirty = false;
        }
    }
}

/// Fully releases a source slot: stops playback, leaves its group, and
/// unregisters from any effect slots.
pub(crate) fn release_source(
    inner: &ContextInner,
    state: &mut ContextState,
    handle: SourceHandle,
) {
    stop_playback(inner, state, handle, true, true);
    let group = state.sources.get(handle).and_then(|e| e.group);
    if let Some(group) = group {
        if let Some(entry) = state.groups.get_mut(group) {
            entry.sources.retain(|&s| s != handle);
        }
    }
    let slot_handles: Vec<SlotHandle> = state
        .sources
        .get(handle)
        .map(|e| e.sends.iter().filter_map(|s| s.slot).collect())
        .unwrap_or_default();
    for slot in slot_handles {
        if let Some(entry) = state.slots.get_mut(slot) {
            entry.registrations.retain(|&(s, _)| s != handle);
        }
    }
    state.sources.remove(handle);
}

/// A logical sound source.
///
/// Cheap to clone; clones refer to the same pool slot and compare equal.
/// Most operations require the owning context to be current.
#[derive(Clone)]
pub struct Source {
    pub(crate) ctx: Context,
    pub(crate) handle: SourceHandle,
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.ctx == other.ctx
    }
}
impl Eq for Source {}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("handle", &self.handle).finish()
    }
}

fn stale_source() -> FernSonicError {
    FernSonicError::StaleHandle("source was released".into())
}

impl Source {
    pub(crate) fn from_parts(ctx: Context, handle: SourceHandle) -> Self {
        Self { ctx, handle }
    }

    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    fn entry<R>(&self, f: impl FnOnce(&SourceEntry) -> R) -> Result<R> {
        let state = self.ctx.lock_state();
        let entry = state.sources.get(self.handle).ok_or_else(stale_source)?;
        Ok(f(entry))
    }

    /// Mutates the entry and, when a voice is leased, applies the change to
    /// the backend in the same critical section.
    fn set_voice_param(
        &self,
        set: impl FnOnce(&mut SourceEntry),
        apply: impl FnOnce(&dyn BackendContext, RawVoice),
    ) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .sources
            .get_mut(self.handle)
            .ok_or_else(stale_source)?;
        set(entry);
        if let Some(voice) = entry.voice {
            apply(self.ctx.inner.backend.as_ref(), voice);
        }
        Ok(())
    }

    /// Mutates the entry and recommits effective gain/pitch.
    fn set_mix_param(&self, set: impl FnOnce(&mut SourceEntry)) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .sources
            .get_mut(self.handle)
            .ok_or_else(stale_source)?;
        set(entry);
        commit_gain_pitch(&self.ctx.inner, &mut state, self.handle);
        Ok(())
    }

    // -- playback ------------------------------------------------------------

    /// Plays a fully loaded buffer. The same buffer may be played by many
    /// sources at once.
    pub fn play(&self, buffer: &Buffer) -> Result<()> {
        self.ctx.check_current()?;
        if buffer.ctx != self.ctx {
            return Err(FernSonicError::InvalidArgument(
                "buffer belongs to a different context".into(),
            ));
        }
        let mut messages = Vec::new();
        let (result, handler) = {
            let mut state = self.ctx.lock_state();
            let result = start_buffer_playback(
                &self.ctx.inner,
                &mut state,
                self.handle,
                buffer.handle,
                &mut messages,
            );
            (result, state.handler.clone())
        };
        self.ctx.dispatch(&handler, messages);
        result
    }

    /// Streams from a decoder: `queue_size` chunks of `chunk_frames` frames
    /// are kept queued, refilled by the context's worker thread. The decoder
    /// must not be used elsewhere while streaming.
    pub fn play_stream(
        &self,
        decoder: Box<dyn Decoder>,
        chunk_frames: u32,
        queue_size: u32,
    ) -> Result<()> {
        if chunk_frames == 0 || queue_size == 0 {
            return Err(FernSonicError::InvalidArgument(
                "chunk length and queue size must be positive".into(),
            ));
        }
        self.ctx.check_current()?;
        self.ctx.ensure_worker();
        let mut messages = Vec::new();
        let (result, handler) = {
            let mut state = self.ctx.lock_state();
            let result = start_stream_playback(
                &self.ctx.inner,
                &mut state,
                self.handle,
                decoder,
                chunk_frames,
                queue_size,
                &mut messages,
            );
            (result, state.handler.clone())
        };
        self.ctx.inner.notify_worker();
        self.ctx.dispatch(&handler, messages);
        result
    }

    /// Prepares playback from a still-loading buffer. Returns immediately;
    /// the source starts playing when [`Context::update`] observes the
    /// future resolve. An already-resolved future plays immediately.
    pub fn play_future(&self, future: &FutureBuffer) -> Result<()> {
        self.ctx.check_current()?;
        if future.ctx != self.ctx {
            return Err(FernSonicError::InvalidArgument(
                "future buffer belongs to a different context".into(),
            ));
        }
        match future.load.poll() {
            Some(Ok(())) => {
                let buffer = Buffer {
                    ctx: self.ctx.clone(),
                    handle: future.handle,
                };
                self.play(&buffer)
            }
            Some(Err(err)) => Err(err),
            None => {
                let mut state = self.ctx.lock_state();
                // Release anything currently playing; pending sources hold
                // no voice until the buffer arrives.
                stop_playback(&self.ctx.inner, &mut state, self.handle, true, true);
                let entry = state
                    .sources
                    .get_mut(self.handle)
                    .ok_or_else(stale_source)?;
                entry.pending = Some(PendingPlay {
                    handle: future.handle,
                    load: future.load.clone(),
                });
                entry.playback = Playback::Pending;
                Ok(())
            }
        }
    }

    /// Stops playback and releases the voice, decoder, and buffer
    /// references. Cancels pending future-buffer playback.
    pub fn stop(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        if !state.sources.contains(self.handle) {
            return Err(stale_source());
        }
        stop_playback(&self.ctx.inner, &mut state, self.handle, true, true);
        Ok(())
    }

    /// Fades to `gain` (relative to the base gain, in `(0, 1)`) over
    /// `duration`, then stops. Driven by [`Context::update`].
    pub fn fade_out_to_stop(&self, gain: f32, duration: Duration) -> Result<()> {
        if !(gain > 0.0 && gain < 1.0) {
            return Err(FernSonicError::InvalidArgument(
                "fade gain must be in (0, 1)".into(),
            ));
        }
        if duration.is_zero() {
            return Err(FernSonicError::InvalidArgument(
                "fade duration must be positive".into(),
            ));
        }
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .sources
            .get_mut(self.handle)
            .ok_or_else(stale_source)?;
        if entry.playback == Playback::Detached {
            return Err(FernSonicError::InvalidArgument(
                "source is not playing".into(),
            ));
        }
        entry.fade = Some(FadeState {
            start: Instant::now(),
            duration,
            target: gain,
        });
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .sources
            .get_mut(self.handle)
            .ok_or_else(stale_source)?;
        let paused = match entry.playback {
            Playback::Buffer => Playback::PausedBuffer,
            Playback::Streaming => Playback::PausedStreaming,
            _ => return Ok(()),
        };
        if let Some(voice) = entry.voice {
            self.ctx.inner.backend.voice_pause(voice)?;
        }
        entry.playback = paused;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .sources
            .get_mut(self.handle)
            .ok_or_else(stale_source)?;
        let playing = match entry.playback {
            Playback::PausedBuffer => Playback::Buffer,
            Playback::PausedStreaming => Playback::Streaming,
            _ => return Ok(()),
        };
        if let Some(voice) = entry.voice {
            self.ctx.inner.backend.voice_play(voice)?;
        }
        entry.playback = playing;
        Ok(())
    }

    /// True while waiting on a future buffer.
    pub fn is_pending(&self) -> Result<bool> {
        self.entry(|e| e.playback == Playback::Pending)
    }

    pub fn is_playing(&self) -> Result<bool> {
        self.entry(|e| e.is_playing())
    }

    pub fn is_paused(&self) -> Result<bool> {
        self.entry(|e| e.is_paused())
    }

    /// Releases the source back to the pool. The handle (and its clones)
    /// become stale.
    pub fn release(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        if !state.sources.contains(self.handle) {
            return Err(stale_source());
        }
        release_source(&self.ctx.inner, &mut state, self.handle);
        Ok(())
    }

    // -- grouping and priority ----------------------------------------------

    /// Joins a source group (`None` leaves the current group).
    pub fn set_group(&self, group: Option<&SourceGroup>) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let new_handle = match group {
            Some(g) => {
                if g.ctx != self.ctx {
                    return Err(FernSonicError::InvalidArgument(
                        "group belongs to a different context".into(),
                    ));
                }
                if !state.groups.contains(g.handle) {
                    return Err(FernSonicError::StaleHandle("group was released".into()));
                }
                Some(g.handle)
            }
            None => None,
        };
        let old = {
            let entry = state
                .sources
                .get_mut(self.handle)
                .ok_or_else(stale_source)?;
            std::mem::replace(&mut entry.group, new_handle)
        };
        if let Some(old) = old {
            if let Some(entry) = state.groups.get_mut(old) {
                entry.sources.retain(|&s| s != self.handle);
            }
        }
        if let Some(new) = new_handle {
            if let Some(entry) = state.groups.get_mut(new) {
                entry.sources.push(self.handle);
            }
        }
        commit_gain_pitch(&self.ctx.inner, &mut state, self.handle);
        Ok(())
    }

    pub fn group(&self) -> Result<Option<SourceGroup>> {
        let state = self.ctx.lock_state();
        let entry = state.sources.get(self.handle).ok_or_else(stale_source)?;
        Ok(entry
            .group
            .map(|h| SourceGroup::from_parts(self.ctx.clone(), h)))
    }

    /// Playback priority; lower-priority sources are evicted first when the
    /// voice pool is exhausted.
    pub fn set_priority(&self, priority: u32) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .sources
            .get_mut(self.handle)
            .ok_or_else(stale_source)?;
        entry.priority = priority;
        Ok(())
    }

    pub fn priority(&self) -> Result<u32> {
        self.entry(|e| e.priority)
    }

    // -- offsets -------------------------------------------------------------

    /// Seeks a playing source, or sets where the next play starts.
    pub fn set_offset(&self, offset: u64) -> Result<()> {
        self.set_voice_param(
            |e| {
                if !e.is_playing() && !e.is_paused() {
                    e.offset = offset;
                }
            },
            |backend, voice| backend.voice_set_f(voice, VoiceParamF::SampleOffset, offset as f32),
        )
    }

    /// `(frames, latency)`. For streams the offset follows the decoder's
    /// consumed-frame count; latency is zero without the source-latency
    /// capability.
    pub fn sample_offset_latency(&self) -> Result<(u64, Duration)> {
        let state = self.ctx.lock_state();
        let entry = state.sources.get(self.handle).ok_or_else(stale_source)?;
        let latency = match entry.voice {
            Some(voice) if self.ctx.inner.has_ext(Extension::SourceLatency) => {
                Duration::from_nanos(self.ctx.inner.backend.voice_latency_ns(voice))
            }
            _ => Duration::ZERO,
        };
        let offset = match (&entry.playback, &entry.stream, entry.voice) {
            (Playback::Streaming | Playback::PausedStreaming, Some(stream), _) => {
                stream.frames_played
            }
            (Playback::Buffer | Playback::PausedBuffer, _, Some(voice)) => {
                self.ctx.inner.backend.voice_sample_offset(voice)
            }
            _ => entry.offset,
        };
        Ok((offset, latency))
    }

    pub fn sample_offset(&self) -> Result<u64> {
        self.sample_offset_latency().map(|(o, _)| o)
    }

    // -- mix parameters ------------------------------------------------------

    /// Whether playback loops on the buffer or decoder loop points.
    pub fn set_looping(&self, looping: bool) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .sources
            .get_mut(self.handle)
            .ok_or_else(stale_source)?;
        entry.looping = looping;
        // Only static-buffer voices loop backend-side.
        if let (Some(voice), Playback::Buffer | Playback::PausedBuffer) =
            (entry.voice, entry.playback)
        {
            self.ctx
                .inner
                .backend
                .voice_set_i(voice, VoiceParamI::Looping, looping as i32);
        }
        Ok(())
    }

    pub fn looping(&self) -> Result<bool> {
        self.entry(|e| e.looping)
    }

    /// Base linear gain; 1.0 is unity.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        if !(gain >= 0.0) {
            return Err(FernSonicError::InvalidArgument("gain out of range".into()));
        }
        self.set_mix_param(|e| e.gain = gain)
    }

    pub fn gain(&self) -> Result<f32> {
        self.entry(|e| e.gain)
    }

    /// Linear pitch multiplier; 1.0 is normal speed.
    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        if !(pitch > 0.0) {
            return Err(FernSonicError::InvalidArgument("pitch out of range".into()));
        }
        self.set_mix_param(|e| e.pitch = pitch)
    }

    pub fn pitch(&self) -> Result<f32> {
        self.entry(|e| e.pitch)
    }

    /// Clamp applied after distance and cone attenuation.
    pub fn set_gain_range(&self, min_gain: f32, max_gain: f32) -> Result<()> {
        if !(min_gain >= 0.0 && min_gain <= max_gain && max_gain <= 1.0) {
            return Err(FernSonicError::InvalidArgument(
                "gain range out of order".into(),
            ));
        }
        self.set_voice_param(
            |e| {
                e.min_gain = min_gain;
                e.max_gain = max_gain;
            },
            |backend, voice| {
                backend.voice_set_f(voice, VoiceParamF::MinGain, min_gain);
                backend.voice_set_f(voice, VoiceParamF::MaxGain, max_gain);
            },
        )
    }

    pub fn gain_range(&self) -> Result<(f32, f32)> {
        self.entry(|e| (e.min_gain, e.max_gain))
    }

    pub fn set_distance_range(&self, ref_distance: f32, max_distance: f32) -> Result<()> {
        if !(ref_distance >= 0.0 && ref_distance <= max_distance) {
            return Err(FernSonicError::InvalidArgument(
                "distance range out of order".into(),
            ));
        }
        self.set_voice_param(
            |e| {
                e.ref_distance = ref_distance;
                e.max_distance = max_distance;
            },
            |backend, voice| {
                backend.voice_set_f(voice, VoiceParamF::ReferenceDistance, ref_distance);
                backend.voice_set_f(voice, VoiceParamF::MaxDistance, max_distance);
            },
        )
    }

    pub fn distance_range(&self) -> Result<(f32, f32)> {
        self.entry(|e| (e.ref_distance, e.max_distance))
    }

    /// Position, velocity, and facing direction in one go.
    pub fn set_3d_parameters(&self, position: Vec3, velocity: Vec3, direction: Vec3) -> Result<()> {
        self.set_voice_param(
            |e| {
                e.position = position;
                e.velocity = velocity;
                e.direction = direction;
                e.orientation = None;
            },
            |backend, voice| {
                backend.voice_set_v3(voice, VoiceParamV::Position, position);
                backend.voice_set_v3(voice, VoiceParamV::Velocity, velocity);
                backend.voice_set_v3(voice, VoiceParamV::Direction, direction);
            },
        )
    }

    pub fn set_position(&self, position: Vec3) -> Result<()> {
        self.set_voice_param(
            |e| e.position = position,
            |backend, voice| backend.voice_set_v3(voice, VoiceParamV::Position, position),
        )
    }

    pub fn position(&self) -> Result<Vec3> {
        self.entry(|e| e.position)
    }

    /// Velocity in units per second; only affects doppler, not position.
    pub fn set_velocity(&self, velocity: Vec3) -> Result<()> {
        self.set_voice_param(
            |e| e.velocity = velocity,
            |backend, voice| backend.voice_set_v3(voice, VoiceParamV::Velocity, velocity),
        )
    }

    pub fn velocity(&self) -> Result<Vec3> {
        self.entry(|e| e.velocity)
    }

    pub fn set_direction(&self, direction: Vec3) -> Result<()> {
        self.set_voice_param(
            |e| {
                e.direction = direction;
                e.orientation = None;
            },
            |backend, voice| backend.voice_set_v3(voice, VoiceParamV::Direction, direction),
        )
    }

    pub fn direction(&self) -> Result<Vec3> {
        self.entry(|e| e.direction)
    }

    /// Full orientation; supersedes the plain facing direction.
    pub fn set_orientation(&self, orientation: Orientation) -> Result<()> {
        self.set_voice_param(
            |e| {
                e.orientation = Some(orientation);
                e.direction = orientation.at;
            },
            |backend, voice| backend.voice_set_orientation(voice, orientation.at, orientation.up),
        )
    }

    pub fn orientation(&self) -> Result<Option<Orientation>> {
        self.entry(|e| e.orientation)
    }

    /// Inner/outer cone angles in degrees.
    pub fn set_cone_angles(&self, inner: f32, outer: f32) -> Result<()> {
        if !(inner >= 0.0 && inner <= outer && outer <= 360.0) {
            return Err(FernSonicError::InvalidArgument(
                "cone angles out of range".into(),
            ));
        }
        self.set_voice_param(
            |e| {
                e.cone_inner = inner;
                e.cone_outer = outer;
            },
            |backend, voice| {
                backend.voice_set_f(voice, VoiceParamF::ConeInnerAngle, inner);
                backend.voice_set_f(voice, VoiceParamF::ConeOuterAngle, outer);
            },
        )
    }

    pub fn cone_angles(&self) -> Result<(f32, f32)> {
        self.entry(|e| (e.cone_inner, e.cone_outer))
    }

    /// Gain (and high-frequency gain, with EFX) outside the outer cone.
    pub fn set_outer_cone_gains(&self, gain: f32, gain_hf: f32) -> Result<()> {
        if !((0.0..=1.0).contains(&gain) && (0.0..=1.0).contains(&gain_hf)) {
            return Err(FernSonicError::InvalidArgument(
                "outer cone gains out of range".into(),
            ));
        }
        let efx = self.ctx.inner.has_ext(Extension::Efx);
        self.set_voice_param(
            |e| {
                e.outer_gain = gain;
                e.outer_gain_hf = gain_hf;
            },
            |backend, voice| {
                backend.voice_set_f(voice, VoiceParamF::ConeOuterGain, gain);
                if efx {
                    backend.voice_set_f(voice, VoiceParamF::ConeOuterGainHF, gain_hf);
                }
            },
        )
    }

    pub fn outer_cone_gains(&self) -> Result<(f32, f32)> {
        self.entry(|e| (e.outer_gain, e.outer_gain_hf))
    }

    /// Distance-attenuation scaling for the direct and send paths.
    pub fn set_rolloff_factors(&self, factor: f32, room_factor: f32) -> Result<()> {
        if !(factor >= 0.0 && room_factor >= 0.0) {
            return Err(FernSonicError::InvalidArgument(
                "rolloff factors out of range".into(),
            ));
        }
        self.set_voice_param(
            |e| {
                e.rolloff = factor;
                e.room_rolloff = room_factor;
            },
            |backend, voice| {
                backend.voice_set_f(voice, VoiceParamF::RolloffFactor, factor);
                backend.voice_set_f(voice, VoiceParamF::RoomRolloffFactor, room_factor);
            },
        )
    }

    pub fn rolloff_factors(&self) -> Result<(f32, f32)> {
        self.entry(|e| (e.rolloff, e.room_rolloff))
    }

    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        if !(0.0..=10.0).contains(&factor) {
            return Err(FernSonicError::InvalidArgument(
                "doppler factor out of range".into(),
            ));
        }
        self.set_voice_param(
            |e| e.doppler = factor,
            |backend, voice| backend.voice_set_f(voice, VoiceParamF::DopplerFactor, factor),
        )
    }

    pub fn doppler_factor(&self) -> Result<f32> {
        self.entry(|e| e.doppler)
    }

    /// Interprets position/velocity/direction relative to the listener.
    pub fn set_relative(&self, relative: bool) -> Result<()> {
        self.set_voice_param(
            |e| e.relative = relative,
            |backend, voice| backend.voice_set_i(voice, VoiceParamI::Relative, relative as i32),
        )
    }

    pub fn relative(&self) -> Result<bool> {
        self.entry(|e| e.relative)
    }

    /// Emission radius; needs the source-radius capability to be audible.
    pub fn set_radius(&self, radius: f32) -> Result<()> {
        if !(radius >= 0.0) {
            return Err(FernSonicError::InvalidArgument("radius out of range".into()));
        }
        let has = self.ctx.inner.has_ext(Extension::SourceRadius);
        self.set_voice_param(
            |e| e.radius = radius,
            |backend, voice| {
                if has {
                    backend.voice_set_f(voice, VoiceParamF::Radius, radius);
                }
            },
        )
    }

    pub fn radius(&self) -> Result<f32> {
        self.entry(|e| e.radius)
    }

    /// Left/right channel angles for stereo content, in radians.
    pub fn set_stereo_angles(&self, left: f32, right: f32) -> Result<()> {
        let has = self.ctx.inner.has_ext(Extension::StereoAngles);
        self.set_voice_param(
            |e| e.stereo_angles = (left, right),
            |backend, voice| {
                if has {
                    backend.voice_set_stereo_angles(voice, left, right);
                }
            },
        )
    }

    pub fn stereo_angles(&self) -> Result<(f32, f32)> {
        self.entry(|e| e.stereo_angles)
    }

    pub fn set_spatialize(&self, mode: Spatialize) -> Result<()> {
        let has = self.ctx.inner.has_ext(Extension::SourceSpatialize);
        self.set_voice_param(
            |e| e.spatialize = mode,
            |backend, voice| {
                if has {
                    let value = match mode {
                        Spatialize::Off => 0,
                        Spatialize::On => 1,
                        Spatialize::Auto => 2,
                    };
                    backend.voice_set_i(voice, VoiceParamI::Spatialize, value);
                }
            },
        )
    }

    pub fn spatialize(&self) -> Result<Spatialize> {
        self.entry(|e| e.spatialize)
    }

    /// Index into [`Context::available_resamplers`].
    pub fn set_resampler_index(&self, index: u32) -> Result<()> {
        let has = self.ctx.inner.has_ext(Extension::SourceResampler);
        self.set_voice_param(
            |e| e.resampler_index = index,
            |backend, voice| {
                if has {
                    backend.voice_set_i(voice, VoiceParamI::ResamplerIndex, index as i32);
                }
            },
        )
    }

    pub fn resampler_index(&self) -> Result<u32> {
        self.entry(|e| e.resampler_index)
    }

    /// Atmospheric high-frequency absorption multiplier, 0 to 10.
    pub fn set_air_absorption_factor(&self, factor: f32) -> Result<()> {
        if !(0.0..=10.0).contains(&factor) {
            return Err(FernSonicError::InvalidArgument(
                "air absorption factor out of range".into(),
            ));
        }
        self.set_voice_param(
            |e| e.air_absorption = factor,
            |backend, voice| {
                backend.voice_set_f(voice, VoiceParamF::AirAbsorptionFactor, factor)
            },
        )
    }

    pub fn air_absorption_factor(&self) -> Result<f32> {
        self.entry(|e| e.air_absorption)
    }

    /// Automatic gain adjustment flags: direct-path HF, send, send HF.
    pub fn set_gain_auto(&self, direct_hf: bool, send: bool, send_hf: bool) -> Result<()> {
        self.set_voice_param(
            |e| e.gain_auto = (direct_hf, send, send_hf),
            |backend, voice| {
                backend.voice_set_i(voice, VoiceParamI::DirectGainHFAuto, direct_hf as i32);
                backend.voice_set_i(voice, VoiceParamI::SendGainAuto, send as i32);
                backend.voice_set_i(voice, VoiceParamI::SendGainHFAuto, send_hf as i32);
            },
        )
    }

    pub fn gain_auto(&self) -> Result<(bool, bool, bool)> {
        self.entry(|e| e.gain_auto)
    }

    // -- filters and sends ---------------------------------------------------

    /// Filter on the direct path.
    pub fn set_direct_filter(&self, filter: FilterParams) -> Result<()> {
        validate_filter(&filter)?;
        self.set_voice_param(
            |e| e.direct_filter = filter,
            |backend, voice| backend.voice_set_direct_filter(voice, filter),
        )
    }

    /// Filter on a send path; the routed effect slot stays in place.
    pub fn set_send_filter(&self, send: u32, filter: FilterParams) -> Result<()> {
        validate_filter(&filter)?;
        self.route_send(send, RouteChange::KeepSlot, Some(filter))
    }

    /// Routes an effect slot into a send path, keeping the send filter.
    pub fn set_auxiliary_send(&self, slot: &AuxiliaryEffectSlot, send: u32) -> Result<()> {
        self.check_slot_context(slot)?;
        self.route_send(send, RouteChange::Set(Some(slot.handle)), None)
    }

    /// Routes an effect slot into a send path with new filter properties.
    pub fn set_auxiliary_send_filter(
        &self,
        slot: &AuxiliaryEffectSlot,
        send: u32,
        filter: FilterParams,
    ) -> Result<()> {
        validate_filter(&filter)?;
        self.check_slot_context(slot)?;
        self.route_send(send, RouteChange::Set(Some(slot.handle)), Some(filter))
    }

    fn check_slot_context(&self, slot: &AuxiliaryEffectSlot) -> Result<()> {
        if slot.ctx != self.ctx {
            return Err(FernSonicError::InvalidArgument(
                "effect slot belongs to a different context".into(),
            ));
        }
        Ok(())
    }

    /// Disconnects any effect slot from a send path.
    pub fn clear_auxiliary_send(&self, send: u32) -> Result<()> {
        self.route_send(send, RouteChange::Set(None), None)
    }

    fn route_send(
        &self,
        send: u32,
        change: RouteChange,
        filter: Option<FilterParams>,
    ) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let (old_slot, new_slot, voice, new_filter) = {
            let entry = state
                .sources
                .get_mut(self.handle)
                .ok_or_else(stale_source)?;
            let voice = entry.voice;
            let slot_state = entry.sends.get_mut(send as usize).ok_or_else(|| {
                FernSonicError::InvalidArgument(format!("send index {send} out of range"))
            })?;
            let old = slot_state.slot;
            let new = match change {
                RouteChange::KeepSlot => old,
                RouteChange::Set(slot) => slot,
            };
            slot_state.slot = new;
            if let Some(f) = filter {
                slot_state.filter = f;
            }
            (old, new, voice, slot_state.filter)
        };

        if let RouteChange::Set(new) = change {
            if let Some(slot) = new {
                if !state.slots.contains(slot) {
                    // Roll the entry back before failing.
                    if let Some(entry) = state.sources.get_mut(self.handle) {
                        if let Some(s) = entry.sends.get_mut(send as usize) {
                            s.slot = old_slot;
                        }
                    }
                    return Err(FernSonicError::StaleHandle(
                        "effect slot was released".into(),
                    ));
                }
            }
            if old_slot != new {
                if let Some(old) = old_slot {
                    if let Some(entry) = state.slots.get_mut(old) {
                        entry
                            .registrations
                            .retain(|&(s, i)| !(s == self.handle && i == send));
                    }
                }
                if let Some(newh) = new {
                    if let Some(entry) = state.slots.get_mut(newh) {
                        entry.registrations.push((self.handle, send));
                    }
                }
            }
        }

        if let Some(voice) = voice {
            let raw = new_slot
                .and_then(|sh| state.slots.get(sh))
                .map(|se| se.raw);
            self.ctx
                .inner
                .backend
                .voice_set_send(voice, send, raw, new_filter)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum RouteChange {
    KeepSlot,
    Set(Option<SlotHandle>),
}

fn validate_filter(filter: &FilterParams) -> Result<()> {
    if filter.gain >= 0.0 && filter.gain_hf >= 0.0 && filter.gain_lf >= 0.0 {
        Ok(())
    } else {
        Err(FernSonicError::InvalidArgument(
            "filter gains out of range".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_multiplier_is_linear_and_clamped() {
        let fade = FadeState {
            start: Instant::now(),
            duration: Duration::from_millis(500),
            target: 0.01,
        };
        let mid = fade.multiplier(fade.start + Duration::from_millis(250));
        assert!((mid - 0.505).abs() < 1e-3);
        let done = fade.multiplier(fade.start + Duration::from_millis(800));
        assert!((done - 0.01).abs() < f32::EPSILON);
        let begin = fade.multiplier(fade.start);
        assert!((begin - 1.0).abs() < f32::EPSILON);
    }
}
