//! The backend capability surface.
//!
//! FernSonic does not talk to audio hardware itself; everything that makes
//! sound goes through the traits in this module. A backend exposes voices
//! (finite objects that each play one sound), immutable sample buffers,
//! listener state, and EFX-style effects. The in-tree [`null`] backend is a
//! complete in-memory implementation used for headless operation and tests;
//! an OpenAL driver is an external crate implementing the same traits.

pub mod null;

use crate::math::Vec3;

/// Raw backend buffer id. Zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawBuffer(pub u64);

/// Raw backend voice id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawVoice(pub u64);

/// Raw backend effect id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEffect(pub u64);

/// Raw backend auxiliary-slot id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawSlot(pub u64);

/// Capabilities probed once per context (or device) and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    Efx,
    MultiChannelFormats,
    BFormat,
    Mulaw,
    MulawMultiChannel,
    MulawBFormat,
    Float32,
    LoopPoints,
    SourceLatency,
    SourceResampler,
    SourceSpatialize,
    SourceRadius,
    StereoAngles,
    Disconnect,
    ThreadLocalContext,
    Hrtf,
    PauseDevice,
}

impl Extension {
    pub const ALL: [Extension; 17] = [
        Extension::Efx,
        Extension::MultiChannelFormats,
        Extension::BFormat,
        Extension::Mulaw,
        Extension::MulawMultiChannel,
        Extension::MulawBFormat,
        Extension::Float32,
        Extension::LoopPoints,
        Extension::SourceLatency,
        Extension::SourceResampler,
        Extension::SourceSpatialize,
        Extension::SourceRadius,
        Extension::StereoAngles,
        Extension::Disconnect,
        Extension::ThreadLocalContext,
        Extension::Hrtf,
        Extension::PauseDevice,
    ];
}

/// Channel layout of decoded audio. B-Format configs use FuMa ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelConfig {
    Mono,
    Stereo,
    Rear,
    Quad,
    X51,
    X61,
    X71,
    BFormat2D,
    BFormat3D,
}

impl ChannelConfig {
    pub fn channel_count(self) -> u32 {
        match self {
            ChannelConfig::Mono => 1,
            ChannelConfig::Stereo | ChannelConfig::Rear => 2,
            ChannelConfig::Quad | ChannelConfig::BFormat3D => 4,
            ChannelConfig::X51 => 6,
            ChannelConfig::X61 => 7,
            ChannelConfig::X71 => 8,
            ChannelConfig::BFormat2D => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelConfig::Mono => "Mono",
            ChannelConfig::Stereo => "Stereo",
            ChannelConfig::Rear => "Rear",
            ChannelConfig::Quad => "Quad",
            ChannelConfig::X51 => "5.1 Surround",
            ChannelConfig::X61 => "6.1 Surround",
            ChannelConfig::X71 => "7.1 Surround",
            ChannelConfig::BFormat2D => "B-Format 2D",
            ChannelConfig::BFormat3D => "B-Format 3D",
        }
    }
}

/// Storage type of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    UInt8,
    Int16,
    Float32,
    Mulaw,
}

impl SampleType {
    pub fn byte_size(self) -> u32 {
        match self {
            SampleType::UInt8 | SampleType::Mulaw => 1,
            SampleType::Int16 => 2,
            SampleType::Float32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleType::UInt8 => "Unsigned 8-bit",
            SampleType::Int16 => "Signed 16-bit",
            SampleType::Float32 => "32-bit float",
            SampleType::Mulaw => "Mulaw",
        }
    }
}

/// A `(channels, sample type)` pair the backend has agreed to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendFormat {
    pub channels: ChannelConfig,
    pub sample_type: SampleType,
}

/// Converts a frame count to a byte count for the given format.
pub fn frames_to_bytes(frames: u64, channels: ChannelConfig, sample_type: SampleType) -> u64 {
    frames * u64::from(channels.channel_count()) * u64::from(sample_type.byte_size())
}

/// Converts a byte count to a whole frame count for the given format.
pub fn bytes_to_frames(bytes: u64, channels: ChannelConfig, sample_type: SampleType) -> u64 {
    bytes / (u64::from(channels.channel_count()) * u64::from(sample_type.byte_size()))
}

/// Playback state reported for a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// Distance attenuation models (mirrors the AL enum set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceModel {
    InverseClamped,
    LinearClamped,
    ExponentClamped,
    Inverse,
    Linear,
    Exponent,
    None,
}

/// Whether a voice gets 3D processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spatialize {
    Off,
    On,
    /// Spatialize only when playing a mono sound.
    Auto,
}

/// Direct/send path filter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub gain: f32,
    /// For low-pass and band-pass filters.
    pub gain_hf: f32,
    /// For high-pass and band-pass filters.
    pub gain_lf: f32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
            gain_lf: 1.0,
        }
    }
}

/// Scalar voice parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceParamF {
    Gain,
    MinGain,
    MaxGain,
    Pitch,
    ReferenceDistance,
    MaxDistance,
    RolloffFactor,
    RoomRolloffFactor,
    DopplerFactor,
    ConeInnerAngle,
    ConeOuterAngle,
    ConeOuterGain,
    ConeOuterGainHF,
    Radius,
    AirAbsorptionFactor,
    SampleOffset,
}

/// Integer / boolean voice parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceParamI {
    Looping,
    Relative,
    Spatialize,
    ResamplerIndex,
    DirectGainHFAuto,
    SendGainAuto,
    SendGainHFAuto,
}

/// Vector voice parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceParamV {
    Position,
    Velocity,
    Direction,
}

/// Scalar listener parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerParamF {
    Gain,
    MetersPerUnit,
}

/// Vector listener parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerParamV {
    Position,
    Velocity,
}

/// Reverb parameters, matching the EAX reverb field set. The standard-reverb
/// downgrade keeps the subset that maps onto the basic effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ReverbProperties {
    pub density: f32,
    pub diffusion: f32,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
    pub decay_time: f32,
    pub decay_hf_ratio: f32,
    pub decay_lf_ratio: f32,
    pub reflections_gain: f32,
    pub reflections_delay: f32,
    pub reflections_pan: [f32; 3],
    pub late_reverb_gain: f32,
    pub late_reverb_delay: f32,
    pub late_reverb_pan: [f32; 3],
    pub echo_time: f32,
    pub echo_depth: f32,
    pub modulation_time: f32,
    pub modulation_depth: f32,
    pub air_absorption_gain_hf: f32,
    pub hf_reference: f32,
    pub lf_reference: f32,
    pub room_rolloff_factor: f32,
    pub decay_hf_limit: bool,
}

impl Default for ReverbProperties {
    /// The generic reverb preset.
    fn default() -> Self {
        Self {
            density: 1.0,
            diffusion: 1.0,
            gain: 0.3162,
            gain_hf: 0.8913,
            gain_lf: 1.0,
            decay_time: 1.49,
            decay_hf_ratio: 0.83,
            decay_lf_ratio: 1.0,
            reflections_gain: 0.0503,
            reflections_delay: 0.007,
            reflections_pan: [0.0; 3],
            late_reverb_gain: 1.2589,
            late_reverb_delay: 0.011,
            late_reverb_pan: [0.0; 3],
            echo_time: 0.25,
            echo_depth: 0.0,
            modulation_time: 0.25,
            modulation_depth: 0.0,
            air_absorption_gain_hf: 0.9943,
            hf_reference: 5000.0,
            lf_reference: 250.0,
            room_rolloff_factor: 0.0,
            decay_hf_limit: true,
        }
    }
}

/// Which reverb variant an effect should be programmed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverbVariant {
    Eax,
    Standard,
}

/// Backend-side failure, carried as an opaque message.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        BackendError(msg.into())
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BackendError {}

impl From<BackendError> for crate::error::FernSonicError {
    fn from(err: BackendError) -> Self {
        crate::error::FernSonicError::Backend(err.0)
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Entry point of a backend implementation.
pub trait BackendDriver: Send + Sync + 'static {
    /// Names of the playback devices this driver can open.
    fn enumerate(&self) -> Vec<String>;

    /// Name of the default playback device, if any.
    fn default_device_name(&self) -> Option<String>;

    /// Opens a playback device; `None` opens the default.
    fn open(&self, name: Option<&str>) -> BackendResult<Box<dyn BackendDevice>>;

    /// Driver-level capability query, independent of any open device.
    fn query_extension(&self, extension: Extension) -> bool;

    /// Clears the process-wide current context.
    fn clear_current(&self) -> BackendResult<()>;

    /// Clears the calling thread's current context. Requires
    /// [`Extension::ThreadLocalContext`].
    fn clear_thread_current(&self) -> BackendResult<()>;
}

/// An open playback device.
pub trait BackendDevice: Send + Sync {
    fn name(&self, full: bool) -> String;

    fn query_extension(&self, extension: Extension) -> bool;

    /// `(major, minor)` version of the backend API.
    fn version(&self) -> (u16, u16);

    /// `(major, minor)` EFX version, `(0, 0)` without [`Extension::Efx`].
    fn efx_version(&self) -> (u16, u16);

    /// Output mixing frequency in hz.
    fn frequency(&self) -> u32;

    /// Auxiliary sends per voice; 0 without [`Extension::Efx`].
    fn max_auxiliary_sends(&self) -> u32;

    fn is_connected(&self) -> bool;

    fn hrtf_names(&self) -> Vec<String>;
    fn is_hrtf_enabled(&self) -> bool;
    fn current_hrtf(&self) -> Option<String>;

    /// Resets the device with `(attribute, value)` pairs.
    fn reset(&self, attributes: &[(i32, i32)]) -> BackendResult<()>;

    fn pause_dsp(&self) -> BackendResult<()>;
    fn resume_dsp(&self) -> BackendResult<()>;

    fn create_context(&self) -> BackendResult<Box<dyn BackendContext>>;

    fn close(&self) -> BackendResult<()>;
}

/// A backend state scope. All playback-object calls implicitly address this
/// context; the orchestration layer guarantees the context is current before
/// issuing them.
pub trait BackendContext: Send + Sync {
    // -- current-context plumbing ------------------------------------------

    /// Makes this context the process-wide current one.
    fn make_current(&self) -> BackendResult<()>;

    /// Makes this context current for the calling thread only. Requires
    /// [`Extension::ThreadLocalContext`].
    fn make_thread_current(&self) -> BackendResult<()>;

    /// True if this context is the one backend calls currently address.
    fn is_current(&self) -> bool;

    fn query_extension(&self, extension: Extension) -> bool;

    /// Defers property commits until [`BackendContext::process`].
    fn suspend(&self);
    fn process(&self);

    fn destroy(&self) -> BackendResult<()>;

    // -- context globals ----------------------------------------------------

    fn set_doppler_factor(&self, factor: f32);
    fn set_speed_of_sound(&self, speed: f32);
    fn set_distance_model(&self, model: DistanceModel);

    fn available_resamplers(&self) -> Vec<String>;
    fn default_resampler_index(&self) -> u32;

    // -- buffers ------------------------------------------------------------

    fn gen_buffer(&self) -> BackendResult<RawBuffer>;
    fn delete_buffer(&self, buffer: RawBuffer) -> BackendResult<()>;

    fn buffer_data(
        &self,
        buffer: RawBuffer,
        format: BackendFormat,
        data: &[u8],
        frequency: u32,
    ) -> BackendResult<()>;

    /// Sets `[start, end)` loop points, in frames. Requires
    /// [`Extension::LoopPoints`].
    fn buffer_set_loop_points(&self, buffer: RawBuffer, start: u32, end: u32)
        -> BackendResult<()>;

    // -- voices -------------------------------------------------------------

    fn gen_voice(&self) -> BackendResult<RawVoice>;
    fn delete_voice(&self, voice: RawVoice) -> BackendResult<()>;

    fn voice_play(&self, voice: RawVoice) -> BackendResult<()>;
    fn voice_pause(&self, voice: RawVoice) -> BackendResult<()>;
    fn voice_stop(&self, voice: RawVoice) -> BackendResult<()>;
    fn voice_rewind(&self, voice: RawVoice) -> BackendResult<()>;

    fn voice_state(&self, voice: RawVoice) -> VoiceState;

    /// Attaches a static buffer (`None` detaches).
    fn voice_set_buffer(&self, voice: RawVoice, buffer: Option<RawBuffer>) -> BackendResult<()>;

    fn voice_queue_buffers(&self, voice: RawVoice, buffers: &[RawBuffer]) -> BackendResult<()>;

    /// Number of queued buffers fully consumed and ready to unqueue.
    fn voice_processed_count(&self, voice: RawVoice) -> u32;

    fn voice_unqueue_buffer(&self, voice: RawVoice) -> BackendResult<RawBuffer>;

    /// Current playback position within the attached/queued data, in frames.
    fn voice_sample_offset(&self, voice: RawVoice) -> u64;

    /// Output latency in nanoseconds; 0 without [`Extension::SourceLatency`].
    fn voice_latency_ns(&self, voice: RawVoice) -> u64;

    fn voice_set_f(&self, voice: RawVoice, param: VoiceParamF, value: f32);
    fn voice_set_i(&self, voice: RawVoice, param: VoiceParamI, value: i32);
    fn voice_set_v3(&self, voice: RawVoice, param: VoiceParamV, value: Vec3);
    fn voice_set_orientation(&self, voice: RawVoice, at: Vec3, up: Vec3);
    fn voice_set_stereo_angles(&self, voice: RawVoice, left: f32, right: f32);

    fn voice_set_direct_filter(&self, voice: RawVoice, filter: FilterParams);
    fn voice_set_send(
        &self,
        voice: RawVoice,
        send: u32,
        slot: Option<RawSlot>,
        filter: FilterParams,
    ) -> BackendResult<()>;

    // -- listener -----------------------------------------------------------

    fn listener_set_f(&self, param: ListenerParamF, value: f32);
    fn listener_set_v3(&self, param: ListenerParamV, value: Vec3);
    fn listener_set_orientation(&self, at: Vec3, up: Vec3);

    // -- effects ------------------------------------------------------------

    fn gen_effect(&self) -> BackendResult<RawEffect>;
    fn delete_effect(&self, effect: RawEffect) -> BackendResult<()>;

    /// True if the backend can program the given reverb variant.
    fn supports_reverb(&self, variant: ReverbVariant) -> bool;

    fn effect_set_reverb(
        &self,
        effect: RawEffect,
        variant: ReverbVariant,
        props: &ReverbProperties,
    ) -> BackendResult<()>;

    fn gen_aux_slot(&self) -> BackendResult<RawSlot>;
    fn delete_aux_slot(&self, slot: RawSlot) -> BackendResult<()>;

    fn aux_slot_set_gain(&self, slot: RawSlot, gain: f32);
    fn aux_slot_set_send_auto(&self, slot: RawSlot, send_auto: bool);

    /// Loads the effect's current parameters into the slot (`None` clears).
    fn aux_slot_apply_effect(&self, slot: RawSlot, effect: Option<RawEffect>) -> BackendResult<()>;
}
