//! Lazy sample-frame producers.
//!
//! A [`Decoder`] turns a [`ByteStream`] into sample frames on demand; the
//! buffer cache uses one to fill a whole backend buffer, streaming sources
//! keep one alive and read chunks from it on the worker thread.
//!
//! Factories are tried in order against an opened stream: user-registered
//! factories first (lexicographic by registration name), then the built-in
//! symphonia-backed factory. A factory that does not recognize the data hands
//! the stream back; the chain rewinds it and moves on.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::backend::{frames_to_bytes, ChannelConfig, SampleType};
use crate::error::{FernSonicError, Result};
use crate::io::ByteStream;

/// An abstract source of sample frames.
///
/// Implementations are driven from the thread that owns them: the caller of
/// a synchronous load, or the context's background worker for asynchronous
/// loads and streaming playback. They are never shared between threads at
/// the same time, hence `Send` but not `Sync`.
pub trait Decoder: Send {
    /// Sample rate, in hz.
    fn frequency(&self) -> u32;

    fn channel_config(&self) -> ChannelConfig;

    fn sample_type(&self) -> SampleType;

    /// Total length in sample frames; 0 when unknown. A decoder of unknown
    /// length cannot be loaded into a full buffer, only streamed.
    fn length(&self) -> u64;

    /// Seeks to the given frame. Returns false if the decoder cannot seek
    /// there.
    fn seek(&mut self, frame: u64) -> bool;

    /// `[start, end)` loop points in frames. `start >= end` means the whole
    /// sound.
    fn loop_points(&self) -> (u64, u64);

    /// Decodes up to `frames` sample frames into `dst` (sized by the
    /// caller), returning how many frames were written. A short read marks
    /// the end of the audio.
    fn read(&mut self, dst: &mut [u8], frames: u32) -> u32;
}

/// Creates [`Decoder`]s for recognized byte streams.
pub trait DecoderFactory: Send + Sync {
    /// Returns a decoder if the stream holds data this factory understands.
    /// The stream is positioned at the start; on `None` the chain rewinds it
    /// and offers it to the next factory.
    fn create_decoder(&self, stream: SharedStream) -> Option<Box<dyn Decoder>>;
}

/// A rewindable handle to an opened byte stream.
///
/// Factories receive the stream through this handle so the chain can take it
/// back (and rewind it) when a factory declines.
#[derive(Clone)]
pub struct SharedStream {
    inner: Arc<Mutex<Box<dyn ByteStream>>>,
}

impl SharedStream {
    pub(crate) fn new(stream: Box<dyn ByteStream>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    pub(crate) fn rewind(&self) -> std::io::Result<()> {
        let mut stream = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stream.seek(SeekFrom::Start(0)).map(|_| ())
    }
}

impl Read for SharedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .read(buf)
    }
}

impl Seek for SharedStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seek(pos)
    }
}

impl MediaSource for SharedStream {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        let mut stream = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let here = stream.stream_position().ok()?;
        let end = stream.seek(SeekFrom::End(0)).ok()?;
        stream.seek(SeekFrom::Start(here)).ok()?;
        Some(end)
    }
}

/// Runs the decoder chain over an opened stream: registered factories in
/// name order, then the built-in one.
pub(crate) fn run_decoder_chain(
    name: &str,
    stream: Box<dyn ByteStream>,
    registered: &BTreeMap<String, Arc<dyn DecoderFactory>>,
) -> Result<Box<dyn Decoder>> {
    let shared = SharedStream::new(stream);
    for (factory_name, factory) in registered {
        if let Some(decoder) = factory.create_decoder(shared.clone()) {
            log::debug!("decoder factory {factory_name:?} accepted {name:?}");
            return Ok(decoder);
        }
        shared
            .rewind()
            .map_err(|e| FernSonicError::Decode(format!("failed to rewind {name}: {e}")))?;
    }

    if let Some(decoder) = SymphoniaDecoderFactory.create_decoder(shared) {
        return Ok(decoder);
    }
    Err(FernSonicError::Decode(format!("no decoder for {name}")))
}

fn channel_config_from_count(count: usize) -> Option<ChannelConfig> {
    match count {
        1 => Some(ChannelConfig::Mono),
        2 => Some(ChannelConfig::Stereo),
        4 => Some(ChannelConfig::Quad),
        6 => Some(ChannelConfig::X51),
        7 => Some(ChannelConfig::X61),
        8 => Some(ChannelConfig::X71),
        _ => None,
    }
}

/// Built-in factory over symphonia's probe, covering the formats enabled at
/// build time (wav, ogg/vorbis, flac, mp3, mp4).
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn create_decoder(&self, stream: SharedStream) -> Option<Box<dyn Decoder>> {
        let mss = MediaSourceStream::new(Box::new(stream), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &Hint::new(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .ok()?;

        let format = probed.format;
        let track = format.default_track()?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let frequency = params.sample_rate?;
        let channel_count = params.channels.map(|c| c.count())?;
        let channels = channel_config_from_count(channel_count)?;
        let length = params.n_frames.unwrap_or(0);

        let codec = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .ok()?;

        Some(Box::new(SymphoniaDecoder {
            format,
            codec,
            track_id,
            frequency,
            channels,
            length,
            pending: Vec::new(),
            skip_frames: 0,
            finished: false,
        }))
    }
}

/// Streaming decoder over a symphonia format reader. Always produces
/// interleaved 32-bit float samples.
struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    codec: Box<dyn CodecDecoder>,
    track_id: u32,
    frequency: u32,
    channels: ChannelConfig,
    length: u64,
    /// Interleaved samples decoded but not yet handed out.
    pending: Vec<f32>,
    /// Frames to drop after a coarse container seek.
    skip_frames: u64,
    finished: bool,
}

impl SymphoniaDecoder {
    /// Decodes the next packet of our track into `pending`. Returns false at
    /// end of stream.
    fn decode_more(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(_)) => return false,
                Err(symphonia::core::errors::Error::ResetRequired) => return false,
                Err(err) => {
                    log::warn!("error reading packet: {err}");
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.codec.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    self.pending.extend_from_slice(buf.samples());
                    if self.skip_frames > 0 {
                        let chans = self.channels.channel_count() as usize;
                        let discard =
                            (self.skip_frames as usize * chans).min(self.pending.len());
                        self.pending.drain(..discard);
                        self.skip_frames -= (discard / chans) as u64;
                    }
                    if !self.pending.is_empty() {
                        return true;
                    }
                }
                Err(symphonia::core::errors::Error::IoError(_)) => return false,
                // Recoverable corruption: skip the packet.
                Err(symphonia::core::errors::Error::DecodeError(err)) => {
                    log::debug!("skipping undecodable packet: {err}");
                }
                Err(err) => {
                    log::warn!("decode failed: {err}");
                    return false;
                }
            }
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn frequency(&self) -> u32 {
        self.frequency
    }

    fn channel_config(&self) -> ChannelConfig {
        self.channels
    }

    fn sample_type(&self) -> SampleType {
        SampleType::Float32
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn seek(&mut self, frame: u64) -> bool {
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame,
                track_id: self.track_id,
            },
        );
        match seeked {
            Ok(to) => {
                self.codec.reset();
                self.pending.clear();
                // Containers may land on a packet boundary before the target.
                self.skip_frames = frame.saturating_sub(to.actual_ts);
                self.finished = false;
                true
            }
            Err(err) => {
                log::debug!("seek to frame {frame} failed: {err}");
                false
            }
        }
    }

    fn loop_points(&self) -> (u64, u64) {
        (0, 0)
    }

    fn read(&mut self, dst: &mut [u8], frames: u32) -> u32 {
        let chans = self.channels.channel_count() as usize;
        let wanted_samples = frames as usize * chans;
        let byte_cap = frames_to_bytes(frames as u64, self.channels, SampleType::Float32) as usize;
        debug_assert!(dst.len() >= byte_cap);

        while self.pending.len() < wanted_samples && !self.finished {
            if !self.decode_more() {
                self.finished = true;
            }
        }

        let take = self.pending.len().min(wanted_samples);
        // Whole frames only.
        let take = take - (take % chans);
        for (i, sample) in self.pending.drain(..take).enumerate() {
            let bytes = sample.to_le_bytes();
            dst[i * 4..i * 4 + 4].copy_from_slice(&bytes);
        }
        (take / chans) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_bytes(frames: u32, rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                let t = i as f32 / rate as f32;
                let sample = (t * 440.0 * 2.0 * std::f32::consts::PI).sin();
                writer.write_sample((sample * i16::MAX as f32 * 0.5) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn open(bytes: Vec<u8>) -> Box<dyn Decoder> {
        let stream = SharedStream::new(Box::new(Cursor::new(bytes)));
        SymphoniaDecoderFactory
            .create_decoder(stream)
            .expect("wav should be recognized")
    }

    #[test]
    fn wav_metadata_is_reported() {
        let decoder = open(wav_bytes(2000, 22_050));
        assert_eq!(decoder.frequency(), 22_050);
        assert_eq!(decoder.channel_config(), ChannelConfig::Mono);
        assert_eq!(decoder.sample_type(), SampleType::Float32);
        assert_eq!(decoder.length(), 2000);
    }

    #[test]
    fn reads_are_frame_accurate_and_short_at_end() {
        let mut decoder = open(wav_bytes(1000, 44_100));
        let mut dst = vec![0u8; 4 * 600];
        assert_eq!(decoder.read(&mut dst, 600), 600);
        assert_eq!(decoder.read(&mut dst, 600), 400);
        assert_eq!(decoder.read(&mut dst, 600), 0);
    }

    #[test]
    fn garbage_is_rejected_by_the_chain() {
        let registered = BTreeMap::new();
        let result = run_decoder_chain(
            "noise.bin",
            Box::new(Cursor::new(vec![0u8; 512])),
            &registered,
        );
        assert!(matches!(result, Err(FernSonicError::Decode(_))));
    }

    #[test]
    fn seek_restarts_reading() {
        let mut decoder = open(wav_bytes(1000, 44_100));
        let mut dst = vec![0u8; 4 * 1000];
        assert_eq!(decoder.read(&mut dst, 1000), 1000);
        assert!(decoder.seek(0));
        assert_eq!(decoder.read(&mut dst, 500), 500);
    }
}
