//! Source playback: the state machine, eviction, fades, streaming, and
//! future-buffer playback.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use fernsonic::backend::{VoiceParamF, VoiceState};
use fernsonic::{Buffer, FernSonicError};
use support::{rig, wait_until, Recorder, Rig, SyntheticDecoder};

fn loaded_buffer(rig: &Rig, name: &str, frames: u64) -> Buffer {
    rig.ctx
        .create_buffer_from(name, Box::new(SyntheticDecoder::new(frames)))
        .unwrap()
}

#[test]
fn play_pause_resume_stop() {
    let rig = rig();
    let buffer = loaded_buffer(&rig, "beep", 4096);
    let source = rig.ctx.create_source().unwrap();

    source.play(&buffer).unwrap();
    assert!(source.is_playing().unwrap());
    let voice = rig.control.voice_ids()[0];
    assert_eq!(rig.control.voice_state(voice), VoiceState::Playing);

    source.pause().unwrap();
    assert!(source.is_paused().unwrap());
    assert_eq!(rig.control.voice_state(voice), VoiceState::Paused);

    source.resume().unwrap();
    assert!(source.is_playing().unwrap());

    source.stop().unwrap();
    assert!(!source.is_playing().unwrap());
    assert!(!source.is_paused().unwrap());
    // The buffer is no longer referenced.
    assert!(!buffer.is_in_use().unwrap());
}

#[test]
fn natural_end_detaches_and_notifies_once() {
    let rig = rig();
    let recorder = Recorder::new();
    rig.ctx.set_message_handler(recorder.clone());

    let buffer = loaded_buffer(&rig, "short", 256);
    let source = rig.ctx.create_source().unwrap();
    source.play(&buffer).unwrap();

    let voice = rig.control.voice_ids()[0];
    rig.control.finish_voice(voice);

    rig.ctx.update().unwrap();
    rig.ctx.update().unwrap();

    assert_eq!(recorder.stopped.load(Ordering::Acquire), 1);
    assert!(recorder.stops_were_detached.load(Ordering::Acquire));
    assert!(!source.is_playing().unwrap());
}

#[test]
fn priority_eviction_stops_only_the_lowest() {
    let rig = rig();
    rig.control.set_voice_limit(2);
    let recorder = Recorder::new();
    rig.ctx.set_message_handler(recorder.clone());

    let buffer = loaded_buffer(&rig, "tone", 4096);
    let low = rig.ctx.create_source().unwrap();
    low.set_priority(1).unwrap();
    low.play(&buffer).unwrap();

    let mid = rig.ctx.create_source().unwrap();
    mid.set_priority(5).unwrap();
    mid.play(&buffer).unwrap();

    let high = rig.ctx.create_source().unwrap();
    high.set_priority(10).unwrap();
    high.play(&buffer).unwrap();

    assert_eq!(recorder.force_stopped.load(Ordering::Acquire), 1);
    assert!(!low.is_playing().unwrap(), "priority 1 source is evicted");
    assert!(mid.is_playing().unwrap());
    assert!(high.is_playing().unwrap());
}

#[test]
fn eviction_never_claims_equal_or_higher_priority() {
    let rig = rig();
    rig.control.set_voice_limit(1);

    let buffer = loaded_buffer(&rig, "tone", 4096);
    let holder = rig.ctx.create_source().unwrap();
    holder.set_priority(7).unwrap();
    holder.play(&buffer).unwrap();

    let contender = rig.ctx.create_source().unwrap();
    contender.set_priority(7).unwrap();
    let err = contender.play(&buffer).unwrap_err();
    assert!(matches!(err, FernSonicError::Capacity(_)));
    assert!(holder.is_playing().unwrap());
}

#[test]
fn released_voices_are_reused() {
    let rig = rig();
    rig.control.set_voice_limit(1);
    let buffer = loaded_buffer(&rig, "tone", 4096);

    let first = rig.ctx.create_source().unwrap();
    first.play(&buffer).unwrap();
    first.stop().unwrap();

    let second = rig.ctx.create_source().unwrap();
    second.play(&buffer).unwrap();
    assert!(second.is_playing().unwrap());
    assert_eq!(rig.control.voice_count(), 1);
}

#[test]
fn fade_out_is_linear_and_detaches_at_the_end() {
    let rig = rig();
    let buffer = loaded_buffer(&rig, "pad", 1 << 20);
    let source = rig.ctx.create_source().unwrap();
    source.play(&buffer).unwrap();
    let voice = rig.control.voice_ids()[0];

    source
        .fade_out_to_stop(0.01, Duration::from_millis(500))
        .unwrap();

    std::thread::sleep(Duration::from_millis(250));
    rig.ctx.update().unwrap();
    let mid_gain = rig.control.voice_f(voice, VoiceParamF::Gain).unwrap();
    assert!(
        (0.45..=0.56).contains(&mid_gain),
        "halfway gain was {mid_gain}"
    );

    std::thread::sleep(Duration::from_millis(320));
    rig.ctx.update().unwrap();
    assert!(!source.is_playing().unwrap(), "fade completion stops");
    assert_ne!(rig.control.voice_state(voice), VoiceState::Playing);
    assert!(!buffer.is_in_use().unwrap());
}

#[test]
fn stale_handles_are_rejected_after_release() {
    let rig = rig();
    let source = rig.ctx.create_source().unwrap();
    source.release().unwrap();

    assert!(matches!(
        source.set_gain(0.5).unwrap_err(),
        FernSonicError::StaleHandle(_)
    ));
    assert!(matches!(
        source.release().unwrap_err(),
        FernSonicError::StaleHandle(_)
    ));

    // The slot is reused with a fresh generation; the old handle stays dead.
    let replacement = rig.ctx.create_source().unwrap();
    assert!(source.priority().is_err());
    assert_eq!(replacement.priority().unwrap(), 0);
}

#[test]
fn streaming_keeps_the_queue_full_and_counts_frames() {
    let rig = rig();
    let source = rig.ctx.create_source().unwrap();
    source
        .play_stream(Box::new(SyntheticDecoder::new(16 * 1024)), 1024, 2)
        .unwrap();
    let voice = rig.control.voice_ids()[0];
    assert_eq!(rig.control.queued_count(voice), 2);

    let mut consumed = 0u64;
    for _ in 0..6 {
        rig.control.complete_queued(voice, 1);
        consumed += 1024;
        let expected = consumed;
        assert!(
            wait_until(Duration::from_secs(2), || {
                rig.ctx.update().unwrap();
                source.sample_offset().unwrap() == expected
                    && rig.control.queued_count(voice) == 2
            }),
            "worker refilled after {consumed} frames"
        );
    }
    assert!(source.is_playing().unwrap());
}

#[test]
fn streaming_recovers_from_underrun_and_ends_cleanly() {
    let rig = rig();
    let recorder = Recorder::new();
    rig.ctx.set_message_handler(recorder.clone());

    let source = rig.ctx.create_source().unwrap();
    // 4 chunks of data in total.
    source
        .play_stream(Box::new(SyntheticDecoder::new(4096)), 1024, 2)
        .unwrap();
    let voice = rig.control.voice_ids()[0];

    // Drain everything queued and stop the voice: an under-run while the
    // decoder still has data. The worker requeues and restarts.
    rig.control.finish_voice(voice);
    assert!(
        wait_until(Duration::from_secs(2), || {
            rig.ctx.update().unwrap();
            rig.control.voice_state(voice) == VoiceState::Playing
        }),
        "voice restarted after under-run"
    );

    // Now let it run dry for real.
    loop {
        rig.control.finish_voice(voice);
        if wait_until(Duration::from_millis(300), || {
            rig.ctx.update().unwrap();
            !source.is_playing().unwrap()
        }) {
            break;
        }
    }
    assert!(wait_until(Duration::from_secs(2), || {
        rig.ctx.update().unwrap();
        recorder.stopped.load(Ordering::Acquire) == 1
    }));
    assert_eq!(source.sample_offset().unwrap(), 0, "detached source rewinds");
}

#[test]
fn streaming_loops_via_decoder_seek() {
    let rig = rig();
    let source = rig.ctx.create_source().unwrap();
    source.set_looping(true).unwrap();
    // Short decoder: 1.5 chunks of data, loops forever.
    source
        .play_stream(Box::new(SyntheticDecoder::new(1536)), 1024, 3)
        .unwrap();
    let voice = rig.control.voice_ids()[0];
    // All three chunks were primed despite the decoder being shorter.
    assert_eq!(rig.control.queued_count(voice), 3);

    rig.control.complete_queued(voice, 2);
    assert!(
        wait_until(Duration::from_secs(2), || {
            rig.ctx.update().unwrap();
            rig.control.queued_count(voice) == 3
        }),
        "looping stream keeps refilling"
    );
    source.stop().unwrap();
}

#[test]
fn future_playback_starts_on_update() {
    let rig = rig();
    let (decoder, gate) = SyntheticDecoder::new(2048).gated();
    let future = rig
        .ctx
        .create_buffer_async_from("later", Box::new(decoder))
        .unwrap();

    let source = rig.ctx.create_source().unwrap();
    source.play_future(&future).unwrap();
    assert!(source.is_pending().unwrap());
    assert!(!source.is_playing().unwrap());

    rig.ctx.update().unwrap();
    assert!(source.is_pending().unwrap(), "still waiting on the decode");

    gate.store(true, Ordering::Release);
    assert!(wait_until(Duration::from_secs(2), || !future.is_pending()));
    rig.ctx.update().unwrap();
    assert!(source.is_playing().unwrap());
    assert!(!source.is_pending().unwrap());

    rig.ctx.remove_buffer(&future.wait().unwrap()).unwrap_err();
    source.stop().unwrap();
}

#[test]
fn failed_future_playback_detaches_quietly() {
    let rig = rig();
    let future = rig
        .ctx
        .create_buffer_async_from("void", Box::new(SyntheticDecoder::new(128).broken()))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || !future.is_pending()));

    let source = rig.ctx.create_source().unwrap();
    let err = source.play_future(&future).unwrap_err();
    assert!(matches!(err, FernSonicError::Decode(_)));
    assert!(!source.is_pending().unwrap());
}

#[test]
fn fade_cancels_pending_future_when_it_finishes_first() {
    let rig = rig();
    let (decoder, gate) = SyntheticDecoder::new(2048).gated();
    let future = rig
        .ctx
        .create_buffer_async_from("too-late", Box::new(decoder))
        .unwrap();

    let source = rig.ctx.create_source().unwrap();
    source.play_future(&future).unwrap();
    source
        .fade_out_to_stop(0.1, Duration::from_millis(30))
        .unwrap();

    std::thread::sleep(Duration::from_millis(60));
    rig.ctx.update().unwrap();
    assert!(!source.is_pending().unwrap(), "fade completion cancels pending");
    assert!(!source.is_playing().unwrap());

    gate.store(true, Ordering::Release);
    assert!(wait_until(Duration::from_secs(2), || !future.is_pending()));
    rig.ctx.update().unwrap();
    assert!(!source.is_playing().unwrap(), "canceled future must not play");
}

#[test]
fn offset_applies_on_next_play() {
    let rig = rig();
    let buffer = loaded_buffer(&rig, "seeky", 4096);
    let source = rig.ctx.create_source().unwrap();

    source.set_offset(1000).unwrap();
    assert_eq!(source.sample_offset().unwrap(), 1000);
    source.play(&buffer).unwrap();

    let voice = rig.control.voice_ids()[0];
    assert_eq!(
        rig.control.voice_f(voice, VoiceParamF::SampleOffset),
        Some(1000.0)
    );
    assert_eq!(source.sample_offset().unwrap(), 1000);
}
