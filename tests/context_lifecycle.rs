//! Current-context discipline, context/device lifecycle, batching, and the
//! decoder registry.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use fernsonic::backend::null::NullDriver;
use fernsonic::backend::Extension;
use fernsonic::{
    ChannelConfig, Decoder, DecoderFactory, DeviceManager, FernSonicError, SampleType,
    SharedStream,
};
use support::{rig, Recorder, SyntheticDecoder};

#[test]
fn operations_require_a_current_context() {
    let manager = DeviceManager::with_driver(Box::new(NullDriver::new()));
    let device = manager.open_playback(None).unwrap();
    let ctx = device.create_context().unwrap();

    assert!(matches!(
        ctx.create_source().unwrap_err(),
        FernSonicError::ContextMismatch(_)
    ));

    ctx.make_current().unwrap();
    assert!(ctx.create_source().is_ok());
    assert_eq!(manager.current_context(), Some(ctx.clone()));

    // Switching away makes the first context unusable again.
    let other = device.create_context().unwrap();
    other.make_current().unwrap();
    assert!(matches!(
        ctx.create_source().unwrap_err(),
        FernSonicError::ContextMismatch(_)
    ));
    assert!(other.create_source().is_ok());
}

#[test]
fn thread_current_overrides_process_current() {
    let rig = rig();
    let device = &rig.device;
    let other = device.create_context().unwrap();

    // Process-current is rig.ctx; make `other` current on this thread only.
    rig.manager.make_thread_current(Some(&other)).unwrap();
    assert!(matches!(
        rig.ctx.create_source().unwrap_err(),
        FernSonicError::ContextMismatch(_)
    ));
    assert!(other.create_source().is_ok());

    // Another thread has no thread slot and falls back to process-current.
    let ctx = rig.ctx.clone();
    let handle = std::thread::spawn(move || ctx.create_source().is_ok());
    assert!(handle.join().unwrap());

    rig.manager.make_thread_current(None).unwrap();
    assert!(rig.ctx.create_source().is_ok());
}

#[test]
fn destroy_requires_cleanup_first() {
    let manager = DeviceManager::with_driver(Box::new(NullDriver::new()));
    let device = manager.open_playback(None).unwrap();
    let ctx = device.create_context().unwrap();
    ctx.make_current().unwrap();

    // Current contexts cannot be destroyed.
    assert!(matches!(
        ctx.destroy().unwrap_err(),
        FernSonicError::InUse(_)
    ));
    manager.make_current(None).unwrap();

    // Neither can contexts that still hold buffers.
    ctx.make_current().unwrap();
    ctx.create_buffer_from("res", Box::new(SyntheticDecoder::new(64)))
        .unwrap();
    manager.make_current(None).unwrap();
    assert!(matches!(
        ctx.destroy().unwrap_err(),
        FernSonicError::InUse(_)
    ));

    ctx.make_current().unwrap();
    ctx.remove_buffer_named("res").unwrap();
    manager.make_current(None).unwrap();

    // Devices refuse to close while a context lives.
    assert!(matches!(
        device.close().unwrap_err(),
        FernSonicError::InUse(_)
    ));

    ctx.destroy().unwrap();
    assert!(matches!(
        ctx.create_source().unwrap_err(),
        FernSonicError::StaleHandle(_)
    ));
    device.close().unwrap();
}

#[test]
fn nested_batches_commit_once() {
    let rig = rig();
    rig.ctx.start_batch().unwrap();
    rig.ctx.start_batch().unwrap();
    rig.ctx.end_batch().unwrap();
    rig.ctx.end_batch().unwrap();
    assert_eq!(rig.control.batch_calls(), (1, 1));
}

#[test]
fn disconnect_is_reported_once() {
    let rig = rig();
    let recorder = Recorder::new();
    rig.ctx.set_message_handler(recorder.clone());

    rig.ctx.update().unwrap();
    assert_eq!(recorder.disconnected.load(Ordering::Acquire), 0);

    rig.control.set_connected(false);
    rig.ctx.update().unwrap();
    rig.ctx.update().unwrap();
    assert_eq!(recorder.disconnected.load(Ordering::Acquire), 1);
}

#[test]
fn wake_interval_round_trips() {
    let rig = rig();
    assert_eq!(rig.ctx.async_wake_interval().as_millis(), 0);
    rig.ctx
        .set_async_wake_interval(std::time::Duration::from_millis(25));
    assert_eq!(rig.ctx.async_wake_interval().as_millis(), 25);
}

#[test]
fn device_queries_reflect_the_backend() {
    let rig = rig();
    assert_eq!(rig.device.version(), (1, 1));
    assert_eq!(rig.device.efx_version(), (1, 0));
    assert_eq!(rig.device.frequency(), 44_100);
    assert_eq!(rig.device.max_auxiliary_sends(), 2);
    assert!(!rig.device.hrtf_names().is_empty());
    assert!(!rig.device.is_hrtf_enabled());
    rig.device.reset(&[]).unwrap();
    assert!(rig.device.is_hrtf_enabled());
    assert_eq!(rig.device.current_hrtf().as_deref(), Some("Built-In HRTF"));

    assert!(rig.ctx.is_supported(ChannelConfig::X51, SampleType::Float32).unwrap());
    let resamplers = rig.ctx.available_resamplers().unwrap();
    assert!(!resamplers.is_empty());
    assert!((rig.ctx.default_resampler_index().unwrap() as usize) < resamplers.len());
}

#[test]
fn missing_capabilities_surface_as_not_supported() {
    let driver = NullDriver::new();
    let control = driver.control();
    control.set_extensions(&[]);
    let manager = DeviceManager::with_driver(Box::new(driver));
    let device = manager.open_playback(None).unwrap();
    let ctx = device.create_context().unwrap();
    ctx.make_current().unwrap();

    assert!(matches!(
        ctx.create_effect().unwrap_err(),
        FernSonicError::NotSupported(_)
    ));
    assert!(matches!(
        ctx.create_auxiliary_effect_slot().unwrap_err(),
        FernSonicError::NotSupported(_)
    ));
    assert!(matches!(
        manager.make_thread_current(Some(&ctx)).unwrap_err(),
        FernSonicError::NotSupported(_)
    ));
    assert!(rig_resamplers_empty(&ctx));
    assert!(!ctx
        .is_supported(ChannelConfig::Mono, SampleType::Float32)
        .unwrap());
}

fn rig_resamplers_empty(ctx: &fernsonic::Context) -> bool {
    ctx.available_resamplers().unwrap().is_empty()
}

#[test]
fn registered_decoders_run_before_the_builtin() {
    struct TagFactory;
    impl DecoderFactory for TagFactory {
        fn create_decoder(&self, mut stream: SharedStream) -> Option<Box<dyn Decoder>> {
            use std::io::Read;
            let mut magic = [0u8; 4];
            stream.read_exact(&mut magic).ok()?;
            (&magic == b"FERN").then(|| Box::new(SyntheticDecoder::new(777)) as Box<dyn Decoder>)
        }
    }

    struct MemIo;
    impl fernsonic::FileIoFactory for MemIo {
        fn open_file(&self, name: &str) -> Option<Box<dyn fernsonic::ByteStream>> {
            (name == "tagged").then(|| {
                Box::new(std::io::Cursor::new(b"FERN....".to_vec()))
                    as Box<dyn fernsonic::ByteStream>
            })
        }
    }

    let rig = rig();
    rig.manager.set_file_io_factory(Arc::new(MemIo));
    let registration = rig
        .manager
        .register_decoder("tag", Arc::new(TagFactory))
        .unwrap();

    let buffer = rig.ctx.get_buffer("tagged").unwrap();
    assert_eq!(buffer.length().unwrap(), 777);
    rig.ctx.remove_buffer(&buffer).unwrap();

    // Once unregistered, the stream falls through to the built-in chain,
    // which cannot decode it.
    drop(registration);
    assert!(matches!(
        rig.ctx.get_buffer("tagged").unwrap_err(),
        FernSonicError::Decode(_)
    ));
}

#[test]
fn extension_probe_is_memoized() {
    let rig = rig();
    assert!(rig.ctx.has_extension(Extension::Efx));
    // Capability changes after the probe are not observed.
    rig.control.set_extensions(&[]);
    assert!(rig.ctx.has_extension(Extension::Efx));
}
