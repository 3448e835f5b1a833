//! Shared fixtures: a null-backend rig, synthetic decoders, and a recording
//! message handler.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fernsonic::backend::null::{NullControl, NullDriver};
use fernsonic::backend::{ChannelConfig, SampleType};
use fernsonic::{Context, Decoder, Device, DeviceManager, MessageHandler, Source};

/// A device manager over its own null backend, with one context made
/// current.
pub struct Rig {
    pub manager: DeviceManager,
    pub control: NullControl,
    pub device: Device,
    pub ctx: Context,
}

pub fn rig() -> Rig {
    let driver = NullDriver::new();
    let control = driver.control();
    let manager = DeviceManager::with_driver(Box::new(driver));
    let device = manager.open_playback(None).expect("open null device");
    let ctx = device.create_context().expect("create context");
    ctx.make_current().expect("make current");
    Rig {
        manager,
        control,
        device,
        ctx,
    }
}

/// Polls `f` until it returns true or the timeout elapses.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    f()
}

/// Mono Int16 decoder producing a deterministic ramp. Optionally gated (reads
/// block until released) or broken (reads produce nothing).
pub struct SyntheticDecoder {
    frames: u64,
    cursor: u64,
    rate: u32,
    loop_points: (u64, u64),
    gate: Option<Arc<AtomicBool>>,
    broken: bool,
}

impl SyntheticDecoder {
    pub fn new(frames: u64) -> Self {
        Self {
            frames,
            cursor: 0,
            rate: 44_100,
            loop_points: (0, 0),
            gate: None,
            broken: false,
        }
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_loop_points(mut self, start: u64, end: u64) -> Self {
        self.loop_points = (start, end);
        self
    }

    /// Reads spin until the returned flag is set.
    pub fn gated(mut self) -> (Self, Arc<AtomicBool>) {
        let gate = Arc::new(AtomicBool::new(false));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Every read returns zero frames.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }
}

impl Decoder for SyntheticDecoder {
    fn frequency(&self) -> u32 {
        self.rate
    }

    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::Mono
    }

    fn sample_type(&self) -> SampleType {
        SampleType::Int16
    }

    fn length(&self) -> u64 {
        self.frames
    }

    fn seek(&mut self, frame: u64) -> bool {
        if frame >= self.frames {
            return false;
        }
        self.cursor = frame;
        true
    }

    fn loop_points(&self) -> (u64, u64) {
        self.loop_points
    }

    fn read(&mut self, dst: &mut [u8], frames: u32) -> u32 {
        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        }
        if self.broken {
            return 0;
        }
        let available = (self.frames - self.cursor).min(u64::from(frames)) as u32;
        for i in 0..available {
            let sample = (self.cursor + u64::from(i)) as i16;
            let bytes = sample.to_le_bytes();
            dst[i as usize * 2..i as usize * 2 + 2].copy_from_slice(&bytes);
        }
        self.cursor += u64::from(available);
        available
    }
}

/// Message handler that records everything it sees.
#[derive(Default)]
pub struct Recorder {
    pub stopped: AtomicUsize,
    pub force_stopped: AtomicUsize,
    pub disconnected: AtomicUsize,
    /// True while every stop notification so far observed a detached source.
    pub stops_were_detached: AtomicBool,
    pub loading: Mutex<Vec<(String, usize)>>,
    /// `old name -> substitute` map consulted by `resource_not_found`.
    pub substitutions: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        let recorder = Recorder::default();
        recorder.stops_were_detached.store(true, Ordering::Release);
        Arc::new(recorder)
    }

    pub fn substitute(&self, from: &str, to: &str) {
        self.substitutions
            .lock()
            .unwrap()
            .push((from.to_string(), to.to_string()));
    }
}

impl MessageHandler for Recorder {
    fn source_stopped(&self, source: Source) {
        self.stopped.fetch_add(1, Ordering::AcqRel);
        if source.is_playing().unwrap_or(false) {
            self.stops_were_detached.store(false, Ordering::Release);
        }
    }

    fn source_force_stopped(&self, source: Source) {
        self.force_stopped.fetch_add(1, Ordering::AcqRel);
        if source.is_playing().unwrap_or(false) {
            self.stops_were_detached.store(false, Ordering::Release);
        }
    }

    fn device_disconnected(&self, _device: Device) {
        self.disconnected.fetch_add(1, Ordering::AcqRel);
    }

    fn buffer_loading(
        &self,
        name: &str,
        _channels: ChannelConfig,
        _sample_type: SampleType,
        _frequency: u32,
        data: &[u8],
    ) {
        self.loading
            .lock()
            .unwrap()
            .push((name.to_string(), data.len()));
    }

    fn resource_not_found(&self, name: &str) -> Option<String> {
        self.substitutions
            .lock()
            .unwrap()
            .iter()
            .find(|(from, _)| from == name)
            .map(|(_, to)| to.clone())
    }
}

/// Writes a mono 16-bit wav of `frames` frames under `dir`, returning its
/// path as a string.
pub fn write_wav(dir: &Path, name: &str, frames: u32, rate: u32) -> String {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    for i in 0..frames {
        let t = i as f32 / rate as f32;
        let sample = (t * 220.0 * 2.0 * std::f32::consts::PI).sin();
        writer
            .write_sample((sample * i16::MAX as f32 * 0.4) as i16)
            .expect("write sample");
    }
    writer.finalize().expect("finalize wav");
    path.to_str().expect("utf-8 path").to_string()
}
