//! Buffer cache behavior: hits, removal, async loads, substitution.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fernsonic::backend::Extension;
use fernsonic::{ChannelConfig, FernSonicError, FileIoFactory, LoadStatus, SampleType};
use support::{rig, wait_until, Recorder, SyntheticDecoder};

#[test]
fn cache_hit_returns_same_buffer_until_removed() {
    let rig = rig();
    let dir = tempfile::tempdir().unwrap();
    let path = support::write_wav(dir.path(), "tone.wav", 2048, 44_100);

    let first = rig.ctx.get_buffer(&path).unwrap();
    let second = rig.ctx.get_buffer(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(rig.control.buffer_count(), 1);

    rig.ctx.remove_buffer(&first).unwrap();
    assert_eq!(rig.control.buffer_count(), 0);

    let third = rig.ctx.get_buffer(&path).unwrap();
    assert_ne!(first, third, "a fresh load must produce a new buffer");
}

#[test]
fn distinct_names_never_alias() {
    let rig = rig();
    let names: Vec<String> = (0..24).map(|i| format!("blip-{i:02}")).collect();
    for (i, name) in names.iter().enumerate() {
        let decoder = Box::new(SyntheticDecoder::new(100 + i as u64));
        rig.ctx.create_buffer_from(name, decoder).unwrap();
    }
    for (i, name) in names.iter().enumerate() {
        let buffer = rig.ctx.find_buffer(name).expect("cached");
        assert_eq!(buffer.length().unwrap(), 100 + i as u64);
        assert_eq!(buffer.name().unwrap(), *name);
    }
}

#[test]
fn create_remove_round_trip_restores_cache() {
    let rig = rig();
    rig.ctx
        .create_buffer_from("keep", Box::new(SyntheticDecoder::new(64)))
        .unwrap();

    let before = rig.control.buffer_count();
    rig.ctx
        .create_buffer_from("transient", Box::new(SyntheticDecoder::new(64)))
        .unwrap();
    let err = rig
        .ctx
        .create_buffer_from("transient", Box::new(SyntheticDecoder::new(64)))
        .unwrap_err();
    assert!(matches!(err, FernSonicError::Duplicate(_)));

    rig.ctx.remove_buffer_named("transient").unwrap();
    assert_eq!(rig.control.buffer_count(), before);

    // Removing a name that is not cached silently succeeds.
    rig.ctx.remove_buffer_named("never-existed").unwrap();
}

#[test]
fn remove_fails_while_a_source_plays_the_buffer() {
    let rig = rig();
    let buffer = rig
        .ctx
        .create_buffer_from("drone", Box::new(SyntheticDecoder::new(4096)))
        .unwrap();
    let source = rig.ctx.create_source().unwrap();
    source.play(&buffer).unwrap();
    assert!(buffer.is_in_use().unwrap());

    let err = rig.ctx.remove_buffer(&buffer).unwrap_err();
    assert!(matches!(err, FernSonicError::InUse(_)));
    assert_eq!(buffer.sources().unwrap(), vec![source.clone()]);

    source.stop().unwrap();
    rig.ctx.remove_buffer(&buffer).unwrap();
}

#[test]
fn loop_points_from_the_decoder_are_normalized() {
    let rig = rig();
    let inverted = rig
        .ctx
        .create_buffer_from(
            "inverted",
            Box::new(SyntheticDecoder::new(500).with_loop_points(90, 20)),
        )
        .unwrap();
    assert_eq!(inverted.loop_points().unwrap(), (0, 500));

    let clamped = rig
        .ctx
        .create_buffer_from(
            "clamped",
            Box::new(SyntheticDecoder::new(500).with_loop_points(100, 9_000)),
        )
        .unwrap();
    assert_eq!(clamped.loop_points().unwrap(), (100, 500));
}

#[test]
fn async_load_resolves_to_a_ready_buffer() {
    let rig = rig();
    let future = rig
        .ctx
        .create_buffer_async_from("bloom", Box::new(SyntheticDecoder::new(1024)))
        .unwrap();
    let buffer = future.wait().unwrap();
    assert_eq!(buffer.length().unwrap(), 1024);
    assert_eq!(buffer.load_status().unwrap(), LoadStatus::Ready);

    // The cache now serves the same buffer synchronously.
    let again = rig.ctx.get_buffer("bloom").unwrap();
    assert_eq!(buffer, again);
}

#[test]
fn concurrent_futures_share_one_load() {
    struct CountingIo {
        opens: Arc<AtomicUsize>,
        dir: std::path::PathBuf,
    }
    impl FileIoFactory for CountingIo {
        fn open_file(&self, name: &str) -> Option<Box<dyn fernsonic::ByteStream>> {
            self.opens.fetch_add(1, Ordering::AcqRel);
            let file = std::fs::File::open(self.dir.join(name)).ok()?;
            Some(Box::new(file))
        }
    }

    let rig = rig();
    let dir = tempfile::tempdir().unwrap();
    support::write_wav(dir.path(), "shared.wav", 2048, 44_100);
    let opens = Arc::new(AtomicUsize::new(0));
    rig.manager.set_file_io_factory(Arc::new(CountingIo {
        opens: opens.clone(),
        dir: dir.path().to_path_buf(),
    }));

    let a = rig.ctx.get_buffer_async("shared.wav").unwrap();
    let b = rig.ctx.get_buffer_async("shared.wav").unwrap();
    let ba = a.wait().unwrap();
    let bb = b.wait().unwrap();
    assert_eq!(ba, bb, "all futures resolve to the same buffer");
    assert_eq!(opens.load(Ordering::Acquire), 1, "exactly one decode");
}

#[test]
fn async_failure_is_recorded_and_resurfaces() {
    let rig = rig();
    let future = rig
        .ctx
        .create_buffer_async_from("hollow", Box::new(SyntheticDecoder::new(256).broken()))
        .unwrap();
    let err = future.wait().unwrap_err();
    assert!(matches!(err, FernSonicError::Decode(_)));

    // The failure sticks to the cache entry.
    let later = rig.ctx.get_buffer("hollow").unwrap_err();
    assert!(matches!(later, FernSonicError::Decode(_)));
}

#[test]
fn precache_failures_are_swallowed() {
    let rig = rig();
    let dir = tempfile::tempdir().unwrap();
    let good = support::write_wav(dir.path(), "good.wav", 1024, 22_050);

    rig.ctx
        .precache_buffers_async(&[good.as_str(), "no/such/file.wav"])
        .unwrap();

    let buffer = rig.ctx.get_buffer(&good).unwrap();
    assert_eq!(buffer.frequency().unwrap(), 22_050);
    assert!(matches!(
        rig.ctx.get_buffer("no/such/file.wav").unwrap_err(),
        FernSonicError::NotFound(_)
    ));
}

#[test]
fn resource_substitution_keeps_the_original_cache_key() {
    let rig = rig();
    let dir = tempfile::tempdir().unwrap();
    let fallback = support::write_wav(dir.path(), "fallback.wav", 512, 44_100);

    let recorder = Recorder::new();
    recorder.substitute("missing.ogg", &fallback);
    rig.ctx.set_message_handler(recorder.clone());

    let buffer = rig.ctx.get_buffer("missing.ogg").unwrap();
    assert_eq!(buffer.name().unwrap(), "missing.ogg");
    assert!(rig.ctx.find_buffer("missing.ogg").is_some());
    assert!(rig.ctx.find_buffer(&fallback).is_none());

    // An unresolvable name still fails cleanly.
    assert!(matches!(
        rig.ctx.get_buffer("gone.ogg").unwrap_err(),
        FernSonicError::NotFound(_)
    ));
}

#[test]
fn buffer_loading_hook_sees_the_decoded_bytes() {
    let rig = rig();
    let recorder = Recorder::new();
    rig.ctx.set_message_handler(recorder.clone());

    rig.ctx
        .create_buffer_from("hooked", Box::new(SyntheticDecoder::new(300)))
        .unwrap();
    let loading = recorder.loading.lock().unwrap();
    assert_eq!(loading.len(), 1);
    assert_eq!(loading[0].0, "hooked");
    // Mono Int16: two bytes per frame.
    assert_eq!(loading[0].1, 600);
}

#[test]
fn unsupported_formats_fail_before_any_enqueue() {
    // The capability probe is memoized at make-current time, so the
    // extension has to disappear before the context exists.
    use fernsonic::backend::null::NullDriver;
    let driver = NullDriver::new();
    let control = driver.control();
    control.remove_extension(Extension::MulawBFormat);
    let manager = fernsonic::DeviceManager::with_driver(Box::new(driver));
    let device = manager.open_playback(None).unwrap();
    let ctx = device.create_context().unwrap();
    ctx.make_current().unwrap();

    struct MulawBFormat(SyntheticDecoder);
    impl fernsonic::Decoder for MulawBFormat {
        fn frequency(&self) -> u32 {
            self.0.frequency()
        }
        fn channel_config(&self) -> ChannelConfig {
            ChannelConfig::BFormat3D
        }
        fn sample_type(&self) -> SampleType {
            SampleType::Mulaw
        }
        fn length(&self) -> u64 {
            self.0.length()
        }
        fn seek(&mut self, frame: u64) -> bool {
            self.0.seek(frame)
        }
        fn loop_points(&self) -> (u64, u64) {
            (0, 0)
        }
        fn read(&mut self, dst: &mut [u8], frames: u32) -> u32 {
            self.0.read(dst, frames)
        }
    }

    let err = ctx
        .create_buffer_async_from("bf", Box::new(MulawBFormat(SyntheticDecoder::new(64))))
        .unwrap_err();
    assert!(matches!(err, FernSonicError::FormatUnsupported(_)));
    assert!(ctx.find_buffer("bf").is_none());
    assert_eq!(control.buffer_count(), 0);
}

#[test]
fn get_buffer_waits_for_an_in_flight_async_load() {
    let rig = rig();
    let (decoder, gate) = SyntheticDecoder::new(2048).gated();
    let future = rig
        .ctx
        .create_buffer_async_from("slow", Box::new(decoder))
        .unwrap();
    assert!(future.is_pending());

    let ctx = rig.ctx.clone();
    let waiter = std::thread::spawn(move || ctx.get_buffer("slow").map(|b| b.length()));
    std::thread::sleep(Duration::from_millis(20));
    gate.store(true, Ordering::Release);

    let length = waiter.join().unwrap().unwrap().unwrap();
    assert_eq!(length, 2048);
    assert!(wait_until(Duration::from_secs(1), || !future.is_pending()));
}
