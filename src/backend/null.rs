//! In-memory backend.
//!
//! The null backend implements the full capability surface against plain
//! data structures. It is the default driver of the process-wide device
//! manager, which makes the crate usable headless; the
//! [`NullControl`] handle additionally lets tests step "playback" forward
//! (completing queued chunks, finishing voices, yanking the connection)
//! without any audio hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;

use crate::math::Vec3;

use super::{
    BackendContext, BackendDevice, BackendDriver, BackendError, BackendFormat, BackendResult,
    DistanceModel, Extension, FilterParams, ListenerParamF, ListenerParamV, RawBuffer, RawEffect,
    RawSlot, RawVoice, ReverbProperties, ReverbVariant, VoiceParamF, VoiceParamI, VoiceParamV,
    VoiceState,
};

const DEVICE_NAME: &str = "FernSonic Null Output";

#[derive(Debug, Clone)]
struct BufferData {
    format: Option<BackendFormat>,
    byte_len: usize,
    frequency: u32,
    frames: u64,
    loop_points: Option<(u32, u32)>,
}

#[derive(Debug)]
struct VoiceData {
    state: VoiceState,
    static_buffer: Option<RawBuffer>,
    queued: VecDeque<RawBuffer>,
    processed: VecDeque<RawBuffer>,
    /// Frames consumed so far, advanced by [`NullControl::complete_queued`].
    offset: u64,
    floats: HashMap<VoiceParamF, f32>,
    ints: HashMap<VoiceParamI, i32>,
    vectors: HashMap<VoiceParamV, Vec3>,
    direct_filter: FilterParams,
    sends: HashMap<u32, (Option<RawSlot>, FilterParams)>,
}

impl VoiceData {
    fn new() -> Self {
        Self {
            state: VoiceState::Initial,
            static_buffer: None,
            queued: VecDeque::new(),
            processed: VecDeque::new(),
            offset: 0,
            floats: HashMap::new(),
            ints: HashMap::new(),
            vectors: HashMap::new(),
            direct_filter: FilterParams::default(),
            sends: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct SlotData {
    gain: f32,
    send_auto: bool,
    applied: Option<(ReverbVariant, ReverbProperties)>,
}

struct NullInner {
    extensions: HashSet<Extension>,
    voice_limit: usize,
    connected: bool,
    eax_reverb: bool,
    frequency: u32,
    max_sends: u32,
    hrtf_enabled: bool,

    next_id: u64,
    contexts: HashSet<u64>,
    buffers: HashMap<u64, BufferData>,
    voices: HashMap<u64, VoiceData>,
    effects: HashMap<u64, Option<(ReverbVariant, ReverbProperties)>>,
    slots: HashMap<u64, SlotData>,

    current: Option<u64>,
    thread_current: HashMap<ThreadId, u64>,

    batch_depth: u32,
    suspend_calls: u32,
    process_calls: u32,
}

impl NullInner {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn voice(&mut self, voice: RawVoice) -> BackendResult<&mut VoiceData> {
        self.voices
            .get_mut(&voice.0)
            .ok_or_else(|| BackendError::new("unknown voice id"))
    }

    fn settle_voice(&mut self, id: u64) {
        // A playing voice with nothing attached and nothing queued stops on
        // its own, like a zero-length play.
        if let Some(v) = self.voices.get_mut(&id) {
            if v.state == VoiceState::Playing
                && v.static_buffer.is_none()
                && v.queued.is_empty()
            {
                v.state = VoiceState::Stopped;
            }
        }
    }
}

struct NullShared {
    inner: Mutex<NullInner>,
}

impl NullShared {
    fn lock(&self) -> MutexGuard<'_, NullInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Driver entry for the null backend.
pub struct NullDriver {
    shared: Arc<NullShared>,
}

impl NullDriver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(NullShared {
                inner: Mutex::new(NullInner {
                    extensions: Extension::ALL.iter().copied().collect(),
                    voice_limit: 256,
                    connected: true,
                    eax_reverb: true,
                    frequency: 44_100,
                    max_sends: 2,
                    hrtf_enabled: false,
                    next_id: 0,
                    contexts: HashSet::new(),
                    buffers: HashMap::new(),
                    voices: HashMap::new(),
                    effects: HashMap::new(),
                    slots: HashMap::new(),
                    current: None,
                    thread_current: HashMap::new(),
                    batch_depth: 0,
                    suspend_calls: 0,
                    process_calls: 0,
                }),
            }),
        }
    }

    /// Inspection and simulation handle shared with this driver.
    pub fn control(&self) -> NullControl {
        NullControl {
            shared: self.shared.clone(),
        }
    }
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendDriver for NullDriver {
    fn enumerate(&self) -> Vec<String> {
        vec![DEVICE_NAME.to_string()]
    }

    fn default_device_name(&self) -> Option<String> {
        Some(DEVICE_NAME.to_string())
    }

    fn open(&self, name: Option<&str>) -> BackendResult<Box<dyn BackendDevice>> {
        match name {
            Some(n) if n != DEVICE_NAME => Err(BackendError::new(format!(
                "no such playback device: {n}"
            ))),
            _ => Ok(Box::new(NullDevice {
                shared: self.shared.clone(),
            })),
        }
    }

    fn query_extension(&self, extension: Extension) -> bool {
        self.shared.lock().extensions.contains(&extension)
    }

    fn clear_current(&self) -> BackendResult<()> {
        self.shared.lock().current = None;
        Ok(())
    }

    fn clear_thread_current(&self) -> BackendResult<()> {
        let tid = std::thread::current().id();
        self.shared.lock().thread_current.remove(&tid);
        Ok(())
    }
}

struct NullDevice {
    shared: Arc<NullShared>,
}

impl BackendDevice for NullDevice {
    fn name(&self, _full: bool) -> String {
        DEVICE_NAME.to_string()
    }

    fn query_extension(&self, extension: Extension) -> bool {
        self.shared.lock().extensions.contains(&extension)
    }

    fn version(&self) -> (u16, u16) {
        (1, 1)
    }

    fn efx_version(&self) -> (u16, u16) {
        if self.query_extension(Extension::Efx) {
            (1, 0)
        } else {
            (0, 0)
        }
    }

    fn frequency(&self) -> u32 {
        self.shared.lock().frequency
    }

    fn max_auxiliary_sends(&self) -> u32 {
        let inner = self.shared.lock();
        if inner.extensions.contains(&Extension::Efx) {
            inner.max_sends
        } else {
            0
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    fn hrtf_names(&self) -> Vec<String> {
        if self.query_extension(Extension::Hrtf) {
            vec!["Built-In HRTF".to_string()]
        } else {
            Vec::new()
        }
    }

    fn is_hrtf_enabled(&self) -> bool {
        let inner = self.shared.lock();
        inner.extensions.contains(&Extension::Hrtf) && inner.hrtf_enabled
    }

    fn current_hrtf(&self) -> Option<String> {
        if self.is_hrtf_enabled() {
            Some("Built-In HRTF".to_string())
        } else {
            None
        }
    }

    fn reset(&self, _attributes: &[(i32, i32)]) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        if !inner.extensions.contains(&Extension::Hrtf) {
            return Err(BackendError::new("device reset requires HRTF support"));
        }
        inner.hrtf_enabled = true;
        Ok(())
    }

    fn pause_dsp(&self) -> BackendResult<()> {
        if !self.query_extension(Extension::PauseDevice) {
            return Err(BackendError::new("pause-device not supported"));
        }
        Ok(())
    }

    fn resume_dsp(&self) -> BackendResult<()> {
        Ok(())
    }

    fn create_context(&self) -> BackendResult<Box<dyn BackendContext>> {
        let mut inner = self.shared.lock();
        let id = inner.alloc_id();
        inner.contexts.insert(id);
        Ok(Box::new(NullContext {
            id,
            shared: self.shared.clone(),
        }))
    }

    fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}

struct NullContext {
    id: u64,
    shared: Arc<NullShared>,
}

impl BackendContext for NullContext {
    fn make_current(&self) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        if !inner.contexts.contains(&self.id) {
            return Err(BackendError::new("context was destroyed"));
        }
        inner.current = Some(self.id);
        Ok(())
    }

    fn make_thread_current(&self) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        if !inner.extensions.contains(&Extension::ThreadLocalContext) {
            return Err(BackendError::new("thread-local contexts not supported"));
        }
        if !inner.contexts.contains(&self.id) {
            return Err(BackendError::new("context was destroyed"));
        }
        inner.thread_current.insert(std::thread::current().id(), self.id);
        Ok(())
    }

    fn is_current(&self) -> bool {
        let inner = self.shared.lock();
        match inner.thread_current.get(&std::thread::current().id()) {
            Some(id) => *id == self.id,
            None => inner.current == Some(self.id),
        }
    }

    fn query_extension(&self, extension: Extension) -> bool {
        self.shared.lock().extensions.contains(&extension)
    }

    fn suspend(&self) {
        let mut inner = self.shared.lock();
        inner.batch_depth += 1;
        inner.suspend_calls += 1;
    }

    fn process(&self) {
        let mut inner = self.shared.lock();
        inner.batch_depth = inner.batch_depth.saturating_sub(1);
        inner.process_calls += 1;
    }

    fn destroy(&self) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        if inner.current == Some(self.id) {
            return Err(BackendError::new("cannot destroy the current context"));
        }
        inner.contexts.remove(&self.id);
        Ok(())
    }

    fn set_doppler_factor(&self, _factor: f32) {}
    fn set_speed_of_sound(&self, _speed: f32) {}
    fn set_distance_model(&self, _model: DistanceModel) {}

    fn available_resamplers(&self) -> Vec<String> {
        vec!["Nearest".to_string(), "Linear".to_string(), "Cubic".to_string()]
    }

    fn default_resampler_index(&self) -> u32 {
        1
    }

    fn gen_buffer(&self) -> BackendResult<RawBuffer> {
        let mut inner = self.shared.lock();
        let id = inner.alloc_id();
        inner.buffers.insert(
            id,
            BufferData {
                format: None,
                byte_len: 0,
                frequency: 0,
                frames: 0,
                loop_points: None,
            },
        );
        Ok(RawBuffer(id))
    }

    fn delete_buffer(&self, buffer: RawBuffer) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let in_use = inner.voices.values().any(|v| {
            v.static_buffer == Some(buffer)
                || v.queued.contains(&buffer)
                || v.processed.contains(&buffer)
        });
        if in_use {
            return Err(BackendError::new("buffer attached to a voice"));
        }
        inner
            .buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or_else(|| BackendError::new("unknown buffer id"))
    }

    fn buffer_data(
        &self,
        buffer: RawBuffer,
        format: BackendFormat,
        data: &[u8],
        frequency: u32,
    ) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let entry = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::new("unknown buffer id"))?;
        entry.format = Some(format);
        entry.byte_len = data.len();
        entry.frequency = frequency;
        entry.frames =
            super::bytes_to_frames(data.len() as u64, format.channels, format.sample_type);
        Ok(())
    }

    fn buffer_set_loop_points(
        &self,
        buffer: RawBuffer,
        start: u32,
        end: u32,
    ) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        if !inner.extensions.contains(&Extension::LoopPoints) {
            return Err(BackendError::new("loop points not supported"));
        }
        let entry = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::new("unknown buffer id"))?;
        entry.loop_points = Some((start, end));
        Ok(())
    }

    fn gen_voice(&self) -> BackendResult<RawVoice> {
        let mut inner = self.shared.lock();
        if inner.voices.len() >= inner.voice_limit {
            return Err(BackendError::new("voice pool exhausted"));
        }
        let id = inner.alloc_id();
        inner.voices.insert(id, VoiceData::new());
        Ok(RawVoice(id))
    }

    fn delete_voice(&self, voice: RawVoice) -> BackendResult<()> {
        self.shared
            .lock()
            .voices
            .remove(&voice.0)
            .map(|_| ())
            .ok_or_else(|| BackendError::new("unknown voice id"))
    }

    fn voice_play(&self, voice: RawVoice) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        inner.voice(voice)?.state = VoiceState::Playing;
        inner.settle_voice(voice.0);
        Ok(())
    }

    fn voice_pause(&self, voice: RawVoice) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let v = inner.voice(voice)?;
        if v.state == VoiceState::Playing {
            v.state = VoiceState::Paused;
        }
        Ok(())
    }

    fn voice_stop(&self, voice: RawVoice) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let v = inner.voice(voice)?;
        v.state = VoiceState::Stopped;
        // Stopping marks the whole queue as processed, like AL does.
        while let Some(b) = v.queued.pop_front() {
            v.processed.push_back(b);
        }
        Ok(())
    }

    fn voice_rewind(&self, voice: RawVoice) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let v = inner.voice(voice)?;
        v.state = VoiceState::Initial;
        v.offset = 0;
        Ok(())
    }

    fn voice_state(&self, voice: RawVoice) -> VoiceState {
        self.shared
            .lock()
            .voices
            .get(&voice.0)
            .map(|v| v.state)
            .unwrap_or(VoiceState::Stopped)
    }

    fn voice_set_buffer(&self, voice: RawVoice, buffer: Option<RawBuffer>) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let v = inner.voice(voice)?;
        if !v.queued.is_empty() || !v.processed.is_empty() {
            v.queued.clear();
            v.processed.clear();
        }
        v.static_buffer = buffer;
        v.offset = 0;
        Ok(())
    }

    fn voice_queue_buffers(&self, voice: RawVoice, buffers: &[RawBuffer]) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        for b in buffers {
            if !inner.buffers.contains_key(&b.0) {
                return Err(BackendError::new("queueing unknown buffer id"));
            }
        }
        let v = inner.voice(voice)?;
        if v.static_buffer.is_some() {
            return Err(BackendError::new("voice has a static buffer attached"));
        }
        v.queued.extend(buffers.iter().copied());
        Ok(())
    }

    fn voice_processed_count(&self, voice: RawVoice) -> u32 {
        self.shared
            .lock()
            .voices
            .get(&voice.0)
            .map(|v| v.processed.len() as u32)
            .unwrap_or(0)
    }

    fn voice_unqueue_buffer(&self, voice: RawVoice) -> BackendResult<RawBuffer> {
        let mut inner = self.shared.lock();
        inner
            .voice(voice)?
            .processed
            .pop_front()
            .ok_or_else(|| BackendError::new("no processed buffers to unqueue"))
    }

    fn voice_sample_offset(&self, voice: RawVoice) -> u64 {
        self.shared
            .lock()
            .voices
            .get(&voice.0)
            .map(|v| v.offset)
            .unwrap_or(0)
    }

    fn voice_latency_ns(&self, voice: RawVoice) -> u64 {
        let inner = self.shared.lock();
        if inner.extensions.contains(&Extension::SourceLatency)
            && inner.voices.contains_key(&voice.0)
        {
            // A plausible fixed output latency for a software mixer.
            1_000_000
        } else {
            0
        }
    }

    fn voice_set_f(&self, voice: RawVoice, param: VoiceParamF, value: f32) {
        let mut inner = self.shared.lock();
        if let Some(v) = inner.voices.get_mut(&voice.0) {
            if param == VoiceParamF::SampleOffset {
                v.offset = value as u64;
            }
            v.floats.insert(param, value);
        }
    }

    fn voice_set_i(&self, voice: RawVoice, param: VoiceParamI, value: i32) {
        let mut inner = self.shared.lock();
        if let Some(v) = inner.voices.get_mut(&voice.0) {
            v.ints.insert(param, value);
        }
    }

    fn voice_set_v3(&self, voice: RawVoice, param: VoiceParamV, value: Vec3) {
        let mut inner = self.shared.lock();
        if let Some(v) = inner.voices.get_mut(&voice.0) {
            v.vectors.insert(param, value);
        }
    }

    fn voice_set_orientation(&self, voice: RawVoice, at: Vec3, _up: Vec3) {
        self.voice_set_v3(voice, VoiceParamV::Direction, at);
    }

    fn voice_set_stereo_angles(&self, _voice: RawVoice, _left: f32, _right: f32) {}

    fn voice_set_direct_filter(&self, voice: RawVoice, filter: FilterParams) {
        let mut inner = self.shared.lock();
        if let Some(v) = inner.voices.get_mut(&voice.0) {
            v.direct_filter = filter;
        }
    }

    fn voice_set_send(
        &self,
        voice: RawVoice,
        send: u32,
        slot: Option<RawSlot>,
        filter: FilterParams,
    ) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        if send >= inner.max_sends {
            return Err(BackendError::new("send index out of range"));
        }
        if let Some(s) = slot {
            if !inner.slots.contains_key(&s.0) {
                return Err(BackendError::new("unknown auxiliary slot id"));
            }
        }
        inner.voice(voice)?.sends.insert(send, (slot, filter));
        Ok(())
    }

    fn listener_set_f(&self, _param: ListenerParamF, _value: f32) {}
    fn listener_set_v3(&self, _param: ListenerParamV, _value: Vec3) {}
    fn listener_set_orientation(&self, _at: Vec3, _up: Vec3) {}

    fn gen_effect(&self) -> BackendResult<RawEffect> {
        let mut inner = self.shared.lock();
        if !inner.extensions.contains(&Extension::Efx) {
            return Err(BackendError::new("EFX not supported"));
        }
        let id = inner.alloc_id();
        inner.effects.insert(id, None);
        Ok(RawEffect(id))
    }

    fn delete_effect(&self, effect: RawEffect) -> BackendResult<()> {
        self.shared
            .lock()
            .effects
            .remove(&effect.0)
            .map(|_| ())
            .ok_or_else(|| BackendError::new("unknown effect id"))
    }

    fn supports_reverb(&self, variant: ReverbVariant) -> bool {
        let inner = self.shared.lock();
        match variant {
            ReverbVariant::Eax => inner.eax_reverb,
            ReverbVariant::Standard => true,
        }
    }

    fn effect_set_reverb(
        &self,
        effect: RawEffect,
        variant: ReverbVariant,
        props: &ReverbProperties,
    ) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        if variant == ReverbVariant::Eax && !inner.eax_reverb {
            return Err(BackendError::new("EAX reverb not supported"));
        }
        let entry = inner
            .effects
            .get_mut(&effect.0)
            .ok_or_else(|| BackendError::new("unknown effect id"))?;
        *entry = Some((variant, props.clone()));
        Ok(())
    }

    fn gen_aux_slot(&self) -> BackendResult<RawSlot> {
        let mut inner = self.shared.lock();
        if !inner.extensions.contains(&Extension::Efx) {
            return Err(BackendError::new("EFX not supported"));
        }
        let id = inner.alloc_id();
        inner.slots.insert(
            id,
            SlotData {
                gain: 1.0,
                send_auto: true,
                applied: None,
            },
        );
        Ok(RawSlot(id))
    }

    fn delete_aux_slot(&self, slot: RawSlot) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let routed = inner
            .voices
            .values()
            .any(|v| v.sends.values().any(|(s, _)| *s == Some(slot)));
        if routed {
            return Err(BackendError::new("auxiliary slot still routed"));
        }
        inner
            .slots
            .remove(&slot.0)
            .map(|_| ())
            .ok_or_else(|| BackendError::new("unknown auxiliary slot id"))
    }

    fn aux_slot_set_gain(&self, slot: RawSlot, gain: f32) {
        if let Some(s) = self.shared.lock().slots.get_mut(&slot.0) {
            s.gain = gain;
        }
    }

    fn aux_slot_set_send_auto(&self, slot: RawSlot, send_auto: bool) {
        if let Some(s) = self.shared.lock().slots.get_mut(&slot.0) {
            s.send_auto = send_auto;
        }
    }

    fn aux_slot_apply_effect(&self, slot: RawSlot, effect: Option<RawEffect>) -> BackendResult<()> {
        let mut inner = self.shared.lock();
        let params = match effect {
            Some(e) => inner
                .effects
                .get(&e.0)
                .ok_or_else(|| BackendError::new("unknown effect id"))?
                .clone(),
            None => None,
        };
        let s = inner
            .slots
            .get_mut(&slot.0)
            .ok_or_else(|| BackendError::new("unknown auxiliary slot id"))?;
        s.applied = params;
        Ok(())
    }
}

/// Shared inspection / simulation handle for the null backend.
///
/// Clones address the same backend state as the driver they came from.
#[derive(Clone)]
pub struct NullControl {
    shared: Arc<NullShared>,
}

impl NullControl {
    /// Caps how many voices [`BackendContext::gen_voice`] will hand out.
    pub fn set_voice_limit(&self, limit: usize) {
        self.shared.lock().voice_limit = limit;
    }

    /// Replaces the advertised capability set.
    pub fn set_extensions(&self, extensions: &[Extension]) {
        self.shared.lock().extensions = extensions.iter().copied().collect();
    }

    pub fn remove_extension(&self, extension: Extension) {
        self.shared.lock().extensions.remove(&extension);
    }

    pub fn set_connected(&self, connected: bool) {
        self.shared.lock().connected = connected;
    }

    pub fn set_eax_reverb_supported(&self, supported: bool) {
        self.shared.lock().eax_reverb = supported;
    }

    /// Number of voices currently generated.
    pub fn voice_count(&self) -> usize {
        self.shared.lock().voices.len()
    }

    /// Ids of every generated voice, ascending.
    pub fn voice_ids(&self) -> Vec<RawVoice> {
        let mut ids: Vec<RawVoice> = self.shared.lock().voices.keys().map(|&k| RawVoice(k)).collect();
        ids.sort();
        ids
    }

    /// `(suspend, process)` call counts, for batching assertions.
    pub fn batch_calls(&self) -> (u32, u32) {
        let inner = self.shared.lock();
        (inner.suspend_calls, inner.process_calls)
    }

    /// Ids of every generated auxiliary slot, ascending.
    pub fn slot_ids(&self) -> Vec<RawSlot> {
        let mut ids: Vec<RawSlot> = self.shared.lock().slots.keys().map(|&k| RawSlot(k)).collect();
        ids.sort_by_key(|s| s.0);
        ids
    }

    pub fn buffer_count(&self) -> usize {
        self.shared.lock().buffers.len()
    }

    pub fn voice_state(&self, voice: RawVoice) -> VoiceState {
        self.shared
            .lock()
            .voices
            .get(&voice.0)
            .map(|v| v.state)
            .unwrap_or(VoiceState::Stopped)
    }

    pub fn voice_f(&self, voice: RawVoice, param: VoiceParamF) -> Option<f32> {
        self.shared
            .lock()
            .voices
            .get(&voice.0)
            .and_then(|v| v.floats.get(&param).copied())
    }

    pub fn voice_i(&self, voice: RawVoice, param: VoiceParamI) -> Option<i32> {
        self.shared
            .lock()
            .voices
            .get(&voice.0)
            .and_then(|v| v.ints.get(&param).copied())
    }

    pub fn queued_count(&self, voice: RawVoice) -> usize {
        self.shared
            .lock()
            .voices
            .get(&voice.0)
            .map(|v| v.queued.len())
            .unwrap_or(0)
    }

    pub fn buffer_loop_points(&self, buffer: RawBuffer) -> Option<(u32, u32)> {
        self.shared
            .lock()
            .buffers
            .get(&buffer.0)
            .and_then(|b| b.loop_points)
    }

    /// Parameters last applied to an auxiliary slot.
    pub fn slot_reverb(&self, slot: RawSlot) -> Option<(ReverbVariant, ReverbProperties)> {
        self.shared
            .lock()
            .slots
            .get(&slot.0)
            .and_then(|s| s.applied.clone())
    }

    /// Marks up to `count` queued chunks as consumed, advancing the voice's
    /// frame offset by their lengths. Emulates playback progress.
    pub fn complete_queued(&self, voice: RawVoice, count: usize) -> usize {
        let mut inner = self.shared.lock();
        let mut frames = Vec::new();
        let mut moved = Vec::new();
        if let Some(v) = inner.voices.get(&voice.0) {
            for b in v.queued.iter().take(count) {
                moved.push(*b);
            }
        }
        for b in &moved {
            if let Some(data) = inner.buffers.get(&b.0) {
                frames.push(data.frames);
            } else {
                frames.push(0);
            }
        }
        if let Some(v) = inner.voices.get_mut(&voice.0) {
            for (b, f) in moved.iter().zip(frames) {
                v.queued.pop_front();
                v.processed.push_back(*b);
                v.offset += f;
            }
        }
        moved.len()
    }

    /// Drives a voice to the natural end of its data: everything queued is
    /// consumed and the voice reports `Stopped`.
    pub fn finish_voice(&self, voice: RawVoice) {
        let mut inner = self.shared.lock();
        let static_buffer = match inner.voices.get_mut(&voice.0) {
            Some(v) => {
                while let Some(b) = v.queued.pop_front() {
                    v.processed.push_back(b);
                }
                v.state = VoiceState::Stopped;
                v.static_buffer
            }
            None => return,
        };
        let full_length = static_buffer.and_then(|sb| inner.buffers.get(&sb.0).map(|d| d.frames));
        if let (Some(frames), Some(v)) = (full_length, inner.voices.get_mut(&voice.0)) {
            v.offset = frames;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_context() -> (NullControl, Box<dyn BackendContext>) {
        let driver = NullDriver::new();
        let control = driver.control();
        let device = driver.open(None).unwrap();
        let ctx = device.create_context().unwrap();
        (control, ctx)
    }

    #[test]
    fn voice_limit_is_enforced() {
        let (control, ctx) = open_context();
        control.set_voice_limit(2);
        ctx.gen_voice().unwrap();
        ctx.gen_voice().unwrap();
        assert!(ctx.gen_voice().is_err());
    }

    #[test]
    fn queue_progress_moves_to_processed() {
        let (control, ctx) = open_context();
        let v = ctx.gen_voice().unwrap();
        let fmt = BackendFormat {
            channels: crate::backend::ChannelConfig::Mono,
            sample_type: crate::backend::SampleType::Int16,
        };
        let b1 = ctx.gen_buffer().unwrap();
        let b2 = ctx.gen_buffer().unwrap();
        ctx.buffer_data(b1, fmt, &[0u8; 64], 44_100).unwrap();
        ctx.buffer_data(b2, fmt, &[0u8; 64], 44_100).unwrap();
        ctx.voice_queue_buffers(v, &[b1, b2]).unwrap();
        ctx.voice_play(v).unwrap();

        assert_eq!(ctx.voice_processed_count(v), 0);
        assert_eq!(control.complete_queued(v, 1), 1);
        assert_eq!(ctx.voice_processed_count(v), 1);
        assert_eq!(ctx.voice_unqueue_buffer(v).unwrap(), b1);
        assert_eq!(ctx.voice_sample_offset(v), 32);
    }

    #[test]
    fn deleting_attached_buffer_fails() {
        let (_control, ctx) = open_context();
        let v = ctx.gen_voice().unwrap();
        let b = ctx.gen_buffer().unwrap();
        ctx.voice_set_buffer(v, Some(b)).unwrap();
        assert!(ctx.delete_buffer(b).is_err());
        ctx.voice_set_buffer(v, None).unwrap();
        assert!(ctx.delete_buffer(b).is_ok());
    }
}
