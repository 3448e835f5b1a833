//! The audio context: the root of a self-contained audio world.
//!
//! A context owns the buffer cache, the source pool, source groups, effects,
//! and a background worker thread that services asynchronous buffer loads
//! and keeps streaming sources fed. Most operations require the context to
//! be "current" — either process-wide or for the calling thread — mirroring
//! how the backend addresses exactly one context at a time.
//!
//! # Locking
//!
//! One mutex (the context-mutex) guards all context state; a second guards
//! the streaming-source set, and a third pairs with the worker's wake
//! condition variable. Lock order is context-mutex → streaming-set; the wake
//! mutex is only ever taken with the other two released. The manager's
//! current-slot mutex may be taken while holding a context-mutex, never the
//! reverse.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{
    BackendContext, BackendFormat, ChannelConfig, DistanceModel, Extension, SampleType,
};
use crate::buffer::{
    decode_all, normalize_loop_points, select_format, Buffer, BufferEntry, BufferHandle,
    BufferKey, FutureBuffer, LoadState, LoadStatus,
};
use crate::decoder::{run_decoder_chain, Decoder};
use crate::device::Device;
use crate::devmgr::DeviceManager;
use crate::effect::{EffectEntry, SlotEntry};
use crate::error::{FernSonicError, Result};
use crate::group::GroupEntry;
use crate::handle::Arena;
use crate::listener::Listener;
use crate::message::{MessageHandler, NullMessageHandler};
use crate::source::{self, Source, SourceEntry, SourceHandle, StreamTick};

/// Capacity of the pending-decode ring. Heavy precaching spins politely
/// until the worker drains a slot.
const PENDING_RING_CAPACITY: usize = 16;

/// A decode request handed to the worker.
pub(crate) struct PendingDecode {
    pub name: String,
    pub handle: BufferHandle,
    pub load: Arc<LoadState>,
    pub decoder: Box<dyn Decoder>,
    pub format: BackendFormat,
    pub frequency: u32,
    pub frames: u64,
}

/// Handler notification collected under the context-mutex and dispatched
/// after it is released, so handlers can call back into the context.
pub(crate) enum ContextMessage {
    Stopped(SourceHandle),
    ForceStopped(SourceHandle),
    Disconnected,
}

pub(crate) struct ContextState {
    pub buffers: Arena<BufferEntry>,
    pub cache: BTreeMap<BufferKey, BufferHandle>,
    pub sources: Arena<SourceEntry>,
    pub groups: Arena<GroupEntry>,
    pub group_names: BTreeMap<String, crate::group::GroupHandle>,
    pub effects: Arena<EffectEntry>,
    pub slots: Arena<SlotEntry>,
    /// Released backend voices, lowest id on top.
    pub free_voices: BinaryHeap<Reverse<crate::backend::RawVoice>>,
    pub pending_tx: rtrb::Producer<PendingDecode>,
    pub handler: Arc<dyn MessageHandler>,
    pub batching: bool,
    pub resamplers: Option<Vec<String>>,
    /// Streaming sources the worker saw drain to completion; `update`
    /// translates these into `source_stopped` notifications.
    pub auto_stopped: Vec<SourceHandle>,
}

pub(crate) struct ContextInner {
    pub backend: Box<dyn BackendContext>,
    pub device: Device,
    pub state: Mutex<ContextState>,
    /// Paired with `state`: the worker waits here until the context is
    /// addressable again. Broadcast on every current-context change.
    pub current_cond: Condvar,
    pub streaming: Mutex<BTreeSet<SourceHandle>>,
    pub wake_lock: Mutex<()>,
    pub wake_cond: Condvar,
    pub wake_interval_ms: AtomicU64,
    pub quit: AtomicBool,
    pub destroyed: AtomicBool,
    pub connected: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending_rx: Mutex<Option<rtrb::Consumer<PendingDecode>>>,
    extensions: OnceLock<HashSet<Extension>>,
}

impl ContextInner {
    pub fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One-shot, memoized capability probe.
    pub fn extensions(&self) -> &HashSet<Extension> {
        self.extensions.get_or_init(|| {
            let set: HashSet<Extension> = Extension::ALL
                .iter()
                .copied()
                .filter(|e| self.backend.query_extension(*e))
                .collect();
            log::debug!("probed {} backend extensions", set.len());
            set
        })
    }

    pub fn has_ext(&self, extension: Extension) -> bool {
        self.extensions().contains(&extension)
    }

    /// Wakes a worker that may be sleeping on either condition.
    pub fn notify_worker(&self) {
        // Briefly toggling the wake mutex guarantees a sleeping worker
        // observes state written before the notify.
        drop(self.wake_lock.lock().unwrap_or_else(|e| e.into_inner()));
        self.wake_cond.notify_all();
        self.current_cond.notify_all();
    }
}

/// Handle to an audio context. Clones address the same context and compare
/// equal.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.inner.device.name(true))
            .finish()
    }
}

impl Context {
    /// Builds a context over a fresh backend context. On error the backend
    /// context is returned so the caller can roll it back.
    pub(crate) fn new(
        device: Device,
        backend: Box<dyn BackendContext>,
    ) -> std::result::Result<Context, (Box<dyn BackendContext>, FernSonicError)> {
        let (pending_tx, pending_rx) = rtrb::RingBuffer::new(PENDING_RING_CAPACITY);
        Ok(Context {
            inner: Arc::new(ContextInner {
                backend,
                device,
                state: Mutex::new(ContextState {
                    buffers: Arena::new(),
                    cache: BTreeMap::new(),
                    sources: Arena::new(),
                    groups: Arena::new(),
                    group_names: BTreeMap::new(),
                    effects: Arena::new(),
                    slots: Arena::new(),
                    free_voices: BinaryHeap::new(),
                    pending_tx,
                    handler: Arc::new(NullMessageHandler),
                    batching: false,
                    resamplers: None,
                    auto_stopped: Vec::new(),
                }),
                current_cond: Condvar::new(),
                streaming: Mutex::new(BTreeSet::new()),
                wake_lock: Mutex::new(()),
                wake_cond: Condvar::new(),
                wake_interval_ms: AtomicU64::new(0),
                quit: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                worker: Mutex::new(None),
                pending_rx: Mutex::new(Some(pending_rx)),
                extensions: OnceLock::new(),
            }),
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.inner.lock_state()
    }

    pub fn device(&self) -> Device {
        self.inner.device.clone()
    }

    pub fn listener(&self) -> Listener {
        Listener { ctx: self.clone() }
    }

    // -- current-context discipline ----------------------------------------

    /// Fails unless this context is the effective current one for the
    /// calling thread: its thread slot, or the process slot when no thread
    /// slot is set.
    pub fn check_current(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(FernSonicError::StaleHandle("context was destroyed".into()));
        }
        let manager = self.inner.device.manager();
        let slots = manager.inner.slots();
        let effective = match slots.thread.get(&std::thread::current().id()) {
            Some(c) => Some(c),
            None => slots.process.as_ref(),
        };
        match effective {
            Some(c) if Arc::ptr_eq(&c.inner, &self.inner) => Ok(()),
            _ => Err(FernSonicError::ContextMismatch(
                "operation requires its context to be current".into(),
            )),
        }
    }

    /// Makes this context the process-wide current context.
    pub fn make_current(&self) -> Result<()> {
        self.inner.device.manager().make_current(Some(self))
    }

    /// Makes this context current for the calling thread only.
    pub fn make_thread_current(&self) -> Result<()> {
        self.inner.device.manager().make_thread_current(Some(self))
    }

    pub(crate) fn make_current_on(
        manager: &DeviceManager,
        context: Option<&Context>,
    ) -> Result<()> {
        if let Some(c) = context {
            if c.inner.device.manager() != *manager {
                return Err(FernSonicError::InvalidArgument(
                    "context belongs to a different device manager".into(),
                ));
            }
            if c.inner.destroyed.load(Ordering::Acquire) {
                return Err(FernSonicError::StaleHandle("context was destroyed".into()));
            }
        }

        let _change = manager
            .inner
            .current_change
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let old = manager.inner.slots().process.clone();

        let same = match (&old, context) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (None, None) => true,
            _ => false,
        };
        if same {
            return Ok(());
        }

        // Hold both context-mutexes across the switch, in pointer order.
        let mut to_lock: Vec<&Context> = Vec::new();
        if let Some(c) = &old {
            to_lock.push(c);
        }
        if let Some(c) = context {
            to_lock.push(c);
        }
        to_lock.sort_by_key(|c| Arc::as_ptr(&c.inner) as usize);
        to_lock.dedup_by(|a, b| Arc::ptr_eq(&a.inner, &b.inner));
        let guards: Vec<_> = to_lock.iter().map(|c| c.lock_state()).collect();

        match context {
            Some(c) => c.inner.backend.make_current()?,
            None => manager.inner.driver.clear_current()?,
        }
        if let Some(c) = context {
            c.inner.extensions();
        }

        {
            let mut slots = manager.inner.slots();
            slots.process = context.cloned();
            slots.thread.remove(&std::thread::current().id());
        }
        drop(guards);

        // The outgoing context's worker may be blocked waiting to become
        // addressable again; the incoming one may be waiting to resume.
        if let Some(c) = &old {
            c.inner.notify_worker();
        }
        if let Some(c) = context {
            c.inner.notify_worker();
        }
        Ok(())
    }

    pub(crate) fn make_thread_current_on(
        manager: &DeviceManager,
        context: Option<&Context>,
    ) -> Result<()> {
        if !manager.query_extension(Extension::ThreadLocalContext) {
            return Err(FernSonicError::NotSupported(
                "thread-local contexts".into(),
            ));
        }
        if let Some(c) = context {
            if c.inner.device.manager() != *manager {
                return Err(FernSonicError::InvalidArgument(
                    "context belongs to a different device manager".into(),
                ));
            }
        }

        let _change = manager
            .inner
            .current_change
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tid = std::thread::current().id();
        let old = manager.inner.slots().thread.get(&tid).cloned();

        let same = match (&old, context) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (None, None) => true,
            _ => false,
        };
        if same {
            return Ok(());
        }

        match context {
            Some(c) => c.inner.backend.make_thread_current()?,
            None => manager.inner.driver.clear_thread_current()?,
        }
        if let Some(c) = context {
            c.inner.extensions();
        }

        {
            let mut slots = manager.inner.slots();
            match context {
                Some(c) => {
                    slots.thread.insert(tid, c.clone());
                }
                None => {
                    slots.thread.remove(&tid);
                }
            }
        }

        if let Some(c) = &old {
            c.inner.notify_worker();
        }
        if let Some(c) = context {
            c.inner.notify_worker();
        }
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Destroys the context. Requires that it is not current anywhere, that
    /// every cached buffer was removed, and that no context handles beyond
    /// this one are still held.
    pub fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(FernSonicError::StaleHandle("context was destroyed".into()));
        }
        let manager = self.inner.device.manager();
        {
            let slots = manager.inner.slots();
            let is_current = slots
                .process
                .as_ref()
                .map_or(false, |c| Arc::ptr_eq(&c.inner, &self.inner))
                || slots
                    .thread
                    .values()
                    .any(|c| Arc::ptr_eq(&c.inner, &self.inner));
            if is_current {
                return Err(FernSonicError::InUse("context is current".into()));
            }
        }
        {
            let state = self.lock_state();
            if state.buffers.len() > 0 {
                return Err(FernSonicError::InUse(format!(
                    "context still holds {} buffer(s)",
                    state.buffers.len()
                )));
            }
        }

        // The worker (if running) holds one strong reference; the device
        // list holds another; ours is the third.
        let worker_alive = {
            let worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.is_some()
        };
        let expected = 2 + usize::from(worker_alive);
        if Arc::strong_count(&self.inner) > expected {
            return Err(FernSonicError::InUse(
                "outstanding context handles exist".into(),
            ));
        }

        self.inner.quit.store(true, Ordering::Release);
        self.inner.notify_worker();
        let handle = {
            let mut worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("context worker panicked during shutdown");
            }
        }

        self.inner.backend.destroy()?;
        self.inner.destroyed.store(true, Ordering::Release);
        self.inner.device.inner.remove_context(self);
        Ok(())
    }

    // -- batching and worker pacing ----------------------------------------

    /// Asks the backend to defer property commits until [`Context::end_batch`].
    /// Nested calls are no-ops; one start/end pair produces one commit.
    pub fn start_batch(&self) -> Result<()> {
        self.check_current()?;
        let mut state = self.lock_state();
        if !state.batching {
            self.inner.backend.suspend();
            state.batching = true;
        }
        Ok(())
    }

    pub fn end_batch(&self) -> Result<()> {
        self.check_current()?;
        let mut state = self.lock_state();
        if state.batching {
            self.inner.backend.process();
            state.batching = false;
        }
        Ok(())
    }

    /// Interval at which the worker wakes to refill streams; zero means it
    /// only wakes on explicit notification. Takes effect immediately, even
    /// for a currently sleeping worker.
    pub fn set_async_wake_interval(&self, interval: Duration) {
        self.inner
            .wake_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        self.inner.notify_worker();
    }

    pub fn async_wake_interval(&self) -> Duration {
        Duration::from_millis(self.inner.wake_interval_ms.load(Ordering::Relaxed))
    }

    /// Installs a message handler, returning the previous one.
    pub fn set_message_handler(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<dyn MessageHandler> {
        let mut state = self.lock_state();
        std::mem::replace(&mut state.handler, handler)
    }

    pub fn message_handler(&self) -> Arc<dyn MessageHandler> {
        self.lock_state().handler.clone()
    }

    pub(crate) fn dispatch(
        &self,
        handler: &Arc<dyn MessageHandler>,
        messages: Vec<ContextMessage>,
    ) {
        for message in messages {
            match message {
                ContextMessage::Stopped(h) => {
                    handler.source_stopped(Source::from_parts(self.clone(), h))
                }
                ContextMessage::ForceStopped(h) => {
                    handler.source_force_stopped(Source::from_parts(self.clone(), h))
                }
                ContextMessage::Disconnected => handler.device_disconnected(self.device()),
            }
        }
    }

    // -- capability and misc queries ---------------------------------------

    pub fn has_extension(&self, extension: Extension) -> bool {
        self.inner.has_ext(extension)
    }

    /// True when the backend can upload this channel/sample-type pair.
    pub fn is_supported(&self, channels: ChannelConfig, sample_type: SampleType) -> Result<bool> {
        self.check_current()?;
        Ok(select_format(channels, sample_type, |e| self.inner.has_ext(e)).is_ok())
    }

    /// Resampler names the backend offers. Non-empty whenever the
    /// source-resampler capability is present.
    pub fn available_resamplers(&self) -> Result<Vec<String>> {
        self.check_current()?;
        let mut state = self.lock_state();
        if !self.inner.has_ext(Extension::SourceResampler) {
            return Ok(Vec::new());
        }
        if state.resamplers.is_none() {
            let mut names = self.inner.backend.available_resamplers();
            if names.is_empty() {
                names.push(String::new());
            }
            state.resamplers = Some(names);
        }
        Ok(state.resamplers.clone().unwrap_or_default())
    }

    pub fn default_resampler_index(&self) -> Result<u32> {
        self.check_current()?;
        if !self.inner.has_ext(Extension::SourceResampler) {
            return Ok(0);
        }
        Ok(self.inner.backend.default_resampler_index())
    }

    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        if !(factor >= 0.0) {
            return Err(FernSonicError::InvalidArgument(
                "doppler factor out of range".into(),
            ));
        }
        self.check_current()?;
        self.inner.backend.set_doppler_factor(factor);
        Ok(())
    }

    /// Speed of sound in units per second; the default is 343.3.
    pub fn set_speed_of_sound(&self, speed: f32) -> Result<()> {
        if !(speed > 0.0) {
            return Err(FernSonicError::InvalidArgument(
                "speed of sound out of range".into(),
            ));
        }
        self.check_current()?;
        self.inner.backend.set_speed_of_sound(speed);
        Ok(())
    }

    pub fn set_distance_model(&self, model: DistanceModel) -> Result<()> {
        self.check_current()?;
        self.inner.backend.set_distance_model(model);
        Ok(())
    }

    // -- decoder resolution -------------------------------------------------

    /// Opens `name` and finds a decoder for it, consulting the message
    /// handler for a substitute when the resource is missing.
    pub fn create_decoder(&self, name: &str) -> Result<Box<dyn Decoder>> {
        self.check_current()?;
        self.create_decoder_impl(name)
    }

    fn create_decoder_impl(&self, name: &str) -> Result<Box<dyn Decoder>> {
        if name.is_empty() {
            return Err(FernSonicError::InvalidArgument(
                "resource name is empty".into(),
            ));
        }
        let manager = self.inner.device.manager();
        let io = manager.file_io_factory();

        let (stream, opened_as) = match io.open_file(name) {
            Some(stream) => (stream, name.to_string()),
            None => {
                // Not found; let the handler substitute names until one
                // opens or it gives up.
                let handler = self.lock_state().handler.clone();
                let mut failing = name.to_string();
                loop {
                    let Some(next) = handler.resource_not_found(&failing) else {
                        return Err(FernSonicError::NotFound(failing));
                    };
                    if next.is_empty() {
                        return Err(FernSonicError::NotFound(failing));
                    }
                    log::info!("substituting {next:?} for missing resource {failing:?}");
                    match io.open_file(&next) {
                        Some(stream) => break (stream, next),
                        None => failing = next,
                    }
                }
            }
        };

        run_decoder_chain(&opened_as, stream, &manager.decoder_snapshot())
    }

    // -- buffer cache -------------------------------------------------------

    pub(crate) fn with_buffer<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&BufferEntry) -> R,
    ) -> Result<R> {
        let state = self.lock_state();
        let entry = state
            .buffers
            .get(handle)
            .ok_or_else(|| FernSonicError::StaleHandle("buffer was removed".into()))?;
        Ok(f(entry))
    }

    /// Synchronously loads (or returns the cached) buffer for `name`. Blocks
    /// while a pending asynchronous load for the same name is in flight.
    pub fn get_buffer(&self, name: &str) -> Result<Buffer> {
        self.check_current()?;
        loop {
            let cached = {
                let state = self.lock_state();
                state
                    .cache
                    .get(&BufferKey::new(name))
                    .map(|&h| (h, state.buffers.get(h).map(|e| e.load.clone())))
            };
            if let Some((handle, load)) = cached {
                let load =
                    load.ok_or_else(|| FernSonicError::StaleHandle("buffer was removed".into()))?;
                load.wait()?;
                return Ok(Buffer {
                    ctx: self.clone(),
                    handle,
                });
            }

            let decoder = self.create_decoder_impl(name)?;
            match self.create_buffer_sync(name, decoder) {
                Ok(handle) => {
                    return Ok(Buffer {
                        ctx: self.clone(),
                        handle,
                    })
                }
                // Raced with another load of the same name; use theirs.
                Err(FernSonicError::Duplicate(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Begins (or joins) an asynchronous load for `name`.
    pub fn get_buffer_async(&self, name: &str) -> Result<FutureBuffer> {
        self.check_current()?;
        if let Some(future) = self.find_buffer_async_impl(name) {
            return Ok(future);
        }
        let decoder = self.create_decoder_impl(name)?;
        match self.create_buffer_async_impl(name, decoder) {
            Err(FernSonicError::Duplicate(_)) => self
                .find_buffer_async_impl(name)
                .ok_or_else(|| FernSonicError::NotFound(name.into())),
            other => other,
        }
    }

    /// Schedules asynchronous loads for every name not already cached.
    /// Failures are swallowed here and surface from a later `get_buffer*`.
    pub fn precache_buffers_async(&self, names: &[&str]) -> Result<()> {
        self.check_current()?;
        for name in names {
            match self.get_buffer_async(name) {
                Ok(_) => {}
                Err(err) => log::debug!("precache of {name:?} failed: {err}"),
            }
        }
        Ok(())
    }

    /// Creates a cached buffer from a caller-supplied decoder. The name must
    /// not already be cached.
    pub fn create_buffer_from(&self, name: &str, decoder: Box<dyn Decoder>) -> Result<Buffer> {
        self.check_current()?;
        let handle = self.create_buffer_sync(name, decoder)?;
        Ok(Buffer {
            ctx: self.clone(),
            handle,
        })
    }

    /// Asynchronous variant of [`Context::create_buffer_from`].
    pub fn create_buffer_async_from(
        &self,
        name: &str,
        decoder: Box<dyn Decoder>,
    ) -> Result<FutureBuffer> {
        self.check_current()?;
        self.create_buffer_async_impl(name, decoder)
    }

    /// Cache lookup without side effects.
    pub fn find_buffer(&self, name: &str) -> Option<Buffer> {
        let state = self.lock_state();
        state.cache.get(&BufferKey::new(name)).map(|&handle| Buffer {
            ctx: self.clone(),
            handle,
        })
    }

    /// Cache lookup without side effects, returning the load future.
    pub fn find_buffer_async(&self, name: &str) -> Option<FutureBuffer> {
        self.find_buffer_async_impl(name)
    }

    fn find_buffer_async_impl(&self, name: &str) -> Option<FutureBuffer> {
        let state = self.lock_state();
        let &handle = state.cache.get(&BufferKey::new(name))?;
        let load = state.buffers.get(handle)?.load.clone();
        Some(FutureBuffer {
            ctx: self.clone(),
            handle,
            load,
        })
    }

    /// Removes the cached buffer with the given name. Absent names are
    /// silently accepted; a buffer still referenced by sources is refused.
    pub fn remove_buffer_named(&self, name: &str) -> Result<()> {
        self.check_current()?;
        let handle = {
            let state = self.lock_state();
            state.cache.get(&BufferKey::new(name)).copied()
        };
        match handle {
            Some(handle) => self.remove_buffer_handle(handle),
            None => Ok(()),
        }
    }

    /// Removes the given cached buffer.
    pub fn remove_buffer(&self, buffer: &Buffer) -> Result<()> {
        self.check_current()?;
        if buffer.ctx != *self {
            return Err(FernSonicError::InvalidArgument(
                "buffer belongs to a different context".into(),
            ));
        }
        self.remove_buffer_handle(buffer.handle)
    }

    fn remove_buffer_handle(&self, handle: BufferHandle) -> Result<()> {
        let mut state = self.lock_state();
        let entry = state
            .buffers
            .get(handle)
            .ok_or_else(|| FernSonicError::StaleHandle("buffer was removed".into()))?;
        if entry.source_refs > 0 {
            return Err(FernSonicError::InUse(format!(
                "buffer {:?} is referenced by {} source(s)",
                entry.name, entry.source_refs
            )));
        }
        if matches!(entry.load.status(), LoadStatus::Pending) {
            return Err(FernSonicError::InUse(format!(
                "buffer {:?} is still loading",
                entry.name
            )));
        }
        let raw = entry.raw;
        let key = BufferKey::new(&entry.name);
        self.inner.backend.delete_buffer(raw)?;
        state.cache.remove(&key);
        state.buffers.remove(handle);
        Ok(())
    }

    pub(crate) fn buffer_set_loop_points(
        &self,
        handle: BufferHandle,
        start: u64,
        end: u64,
    ) -> Result<()> {
        self.check_current()?;
        let mut state = self.lock_state();
        let entry = state
            .buffers
            .get_mut(handle)
            .ok_or_else(|| FernSonicError::StaleHandle("buffer was removed".into()))?;
        if entry.source_refs > 0 {
            return Err(FernSonicError::InUse("buffer is playing".into()));
        }
        if self.inner.has_ext(Extension::LoopPoints) {
            if start >= end || end > entry.frames {
                return Err(FernSonicError::InvalidArgument(
                    "loop points out of range".into(),
                ));
            }
            self.inner
                .backend
                .buffer_set_loop_points(entry.raw, start as u32, end as u32)?;
        } else if start != 0 || end != entry.frames {
            return Err(FernSonicError::NotSupported(
                "buffer loop points".into(),
            ));
        }
        entry.loop_points = (start, end);
        Ok(())
    }

    pub(crate) fn buffer_sources(&self, handle: BufferHandle) -> Result<Vec<Source>> {
        let state = self.lock_state();
        if !state.buffers.contains(handle) {
            return Err(FernSonicError::StaleHandle("buffer was removed".into()));
        }
        Ok(state
            .sources
            .iter()
            .filter(|(_, e)| e.buffer == Some(handle))
            .map(|(h, _)| Source::from_parts(self.clone(), h))
            .collect())
    }

    /// Full synchronous decode + upload. Fails with `Duplicate` if the name
    /// is cached by the time the decoded data is ready to insert.
    fn create_buffer_sync(&self, name: &str, mut decoder: Box<dyn Decoder>) -> Result<BufferHandle> {
        let frequency = decoder.frequency();
        let channels = decoder.channel_config();
        let sample_type = decoder.sample_type();
        let declared = decoder.length();
        if declared == 0 {
            return Err(FernSonicError::Decode(format!(
                "decoder for {name:?} has unknown length"
            )));
        }
        let format = select_format(channels, sample_type, |e| self.inner.has_ext(e))?;

        let (data, frames) = decode_all(&mut *decoder, declared)?;
        let loop_points = normalize_loop_points(decoder.loop_points(), frames);

        let handler = self.lock_state().handler.clone();
        handler.buffer_loading(name, channels, sample_type, frequency, &data);

        let mut state = self.lock_state();
        let key = BufferKey::new(name);
        if state.cache.contains_key(&key) {
            return Err(FernSonicError::Duplicate(format!("buffer {name:?}")));
        }

        let raw = self.inner.backend.gen_buffer()?;
        if let Err(err) = self.inner.backend.buffer_data(raw, format, &data, frequency) {
            let _ = self.inner.backend.delete_buffer(raw);
            return Err(err.into());
        }
        if self.inner.has_ext(Extension::LoopPoints) {
            if let Err(err) = self.inner.backend.buffer_set_loop_points(
                raw,
                loop_points.0 as u32,
                loop_points.1 as u32,
            ) {
                log::warn!("failed to set loop points on {name:?}: {err}");
            }
        }

        let handle = state.buffers.insert(BufferEntry {
            name: name.to_string(),
            raw,
            frequency,
            channels,
            sample_type,
            frames,
            loop_points,
            load: LoadState::ready(),
            source_refs: 0,
        });
        state.cache.insert(key, handle);
        log::debug!("loaded buffer {name:?} ({frames} frames at {frequency} hz)");
        Ok(handle)
    }

    /// Allocates the backend buffer, inserts a pending cache entry, and
    /// hands the decode to the worker. Format problems surface here, before
    /// anything is enqueued.
    fn create_buffer_async_impl(
        &self,
        name: &str,
        decoder: Box<dyn Decoder>,
    ) -> Result<FutureBuffer> {
        let frequency = decoder.frequency();
        let channels = decoder.channel_config();
        let sample_type = decoder.sample_type();
        let frames = decoder.length();
        if frames == 0 {
            return Err(FernSonicError::Decode(format!(
                "decoder for {name:?} has unknown length"
            )));
        }
        let format = select_format(channels, sample_type, |e| self.inner.has_ext(e))?;

        self.ensure_worker();

        let mut state = self.lock_state();
        let key = BufferKey::new(name);
        if state.cache.contains_key(&key) {
            return Err(FernSonicError::Duplicate(format!("buffer {name:?}")));
        }

        let raw = self.inner.backend.gen_buffer()?;
        let load = LoadState::pending();
        let handle = state.buffers.insert(BufferEntry {
            name: name.to_string(),
            raw,
            frequency,
            channels,
            sample_type,
            frames,
            loop_points: (0, frames),
            load: load.clone(),
            source_refs: 0,
        });
        state.cache.insert(key, handle);

        let mut record = Some(PendingDecode {
            name: name.to_string(),
            handle,
            load: load.clone(),
            decoder,
            format,
            frequency,
            frames,
        });
        // The ring holds 16 records; politely spin when a precache burst
        // fills it, releasing the lock so the worker can drain.
        loop {
            match state.pending_tx.push(record.take().expect("record present")) {
                Ok(()) => break,
                Err(rtrb::PushError::Full(returned)) => {
                    record = Some(returned);
                    drop(state);
                    std::thread::yield_now();
                    state = self.lock_state();
                }
            }
        }
        drop(state);
        self.inner.notify_worker();

        Ok(FutureBuffer {
            ctx: self.clone(),
            handle,
            load,
        })
    }

    // -- object creation ----------------------------------------------------

    /// Creates a new logical source. Sources are plentiful; backend voices
    /// are leased only while playing.
    pub fn create_source(&self) -> Result<Source> {
        self.check_current()?;
        let max_sends = self.inner.device.max_auxiliary_sends();
        let mut state = self.lock_state();
        let handle = state.sources.insert(SourceEntry::new(max_sends));
        Ok(Source::from_parts(self.clone(), handle))
    }

    // -- update tick --------------------------------------------------------

    /// Foreground update: resolves pending future-buffers, advances fades,
    /// reaps naturally stopped sources, commits dirty gain/pitch, checks the
    /// device connection, and nudges the worker when it has no timer.
    pub fn update(&self) -> Result<()> {
        self.check_current()?;
        let mut messages = Vec::new();
        let handler = {
            let mut state = self.lock_state();
            for handle in std::mem::take(&mut state.auto_stopped) {
                messages.push(ContextMessage::Stopped(handle));
            }
            let handles = state.sources.handles();
            for handle in handles {
                source::foreground_update(&self.inner, &mut state, handle, &mut messages);
            }

            if self.inner.has_ext(Extension::Disconnect)
                && self.inner.connected.load(Ordering::Relaxed)
            {
                let connected = self.inner.device.is_connected();
                if !connected {
                    messages.push(ContextMessage::Disconnected);
                }
                self.inner.connected.store(connected, Ordering::Relaxed);
            }
            state.handler.clone()
        };

        if self.inner.wake_interval_ms.load(Ordering::Relaxed) == 0 {
            // Kept lock-free on purpose; a missed wake is made up by the
            // next update call.
            self.inner.wake_cond.notify_all();
        }

        self.dispatch(&handler, messages);
        Ok(())
    }

    // -- worker -------------------------------------------------------------

    /// Starts the background worker if it is not already running.
    pub(crate) fn ensure_worker(&self) {
        let mut slot = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let rx = {
            let mut rx_slot = self
                .inner
                .pending_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            rx_slot.take()
        };
        let Some(rx) = rx else {
            return;
        };
        let inner = self.inner.clone();
        match std::thread::Builder::new()
            .name("fernsonic-worker".into())
            .spawn(move || background_proc(inner, rx))
        {
            Ok(handle) => *slot = Some(handle),
            Err(err) => log::error!("failed to spawn context worker: {err}"),
        }
    }
}

/// The worker loop: keep streams fed, then service one pending decode per
/// pass, then sleep until notified or the wake interval elapses. After a
/// sleep the worker waits until its context is addressable again (skipped
/// when it made itself thread-current at startup).
fn background_proc(inner: Arc<ContextInner>, mut rx: rtrb::Consumer<PendingDecode>) {
    let thread_current = inner.has_ext(Extension::ThreadLocalContext)
        && inner.backend.make_thread_current().is_ok();
    log::debug!("context worker started (thread-current: {thread_current})");

    let mut state = inner.lock_state();
    while !inner.quit.load(Ordering::Acquire) {
        {
            let mut streaming = inner.streaming.lock().unwrap_or_else(|e| e.into_inner());
            streaming.retain(|&handle| match source::update_stream(&inner, &mut state, handle) {
                StreamTick::Continue => true,
                StreamTick::Finished => {
                    state.auto_stopped.push(handle);
                    false
                }
                StreamTick::Gone => false,
            });
        }

        // One decode per pass so a batch of large loads cannot starve the
        // streaming sources above.
        if let Ok(mut record) = rx.pop() {
            let handler = state.handler.clone();
            drop(state);
            let decoded = decode_record(&handler, &mut record);
            state = inner.lock_state();
            finish_pending(&inner, &mut state, record, decoded);
            continue;
        }

        drop(state);
        {
            let wake = inner.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.quit.load(Ordering::Acquire) && rx.is_empty() {
                let interval = inner.wake_interval_ms.load(Ordering::Relaxed);
                if interval == 0 {
                    let _unused = inner.wake_cond.wait(wake);
                } else {
                    let _unused = inner
                        .wake_cond
                        .wait_timeout(wake, Duration::from_millis(interval));
                }
            }
        }
        state = inner.lock_state();
        if !thread_current {
            while !inner.quit.load(Ordering::Acquire) && !inner.backend.is_current() {
                state = inner
                    .current_cond
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }
    drop(state);

    // Anything still queued will never decode; fail the waiters.
    while let Ok(record) = rx.pop() {
        record.load.settle(LoadStatus::Failed(FernSonicError::Decode(
            "context shut down before the load ran".into(),
        )));
    }
    if thread_current {
        let _ = inner.device.manager().inner.driver.clear_thread_current();
    }
    log::debug!("context worker exited");
}

type Decoded = Result<(Vec<u8>, u64, (u64, u64))>;

/// Runs outside the context-mutex: the full decode and the buffer-loading
/// callback.
fn decode_record(handler: &Arc<dyn MessageHandler>, record: &mut PendingDecode) -> Decoded {
    let (data, frames) = decode_all(&mut *record.decoder, record.frames)?;
    let loop_points = normalize_loop_points(record.decoder.loop_points(), frames);
    handler.buffer_loading(
        &record.name,
        record.format.channels,
        record.format.sample_type,
        record.frequency,
        &data,
    );
    Ok((data, frames, loop_points))
}

fn finish_pending(
    inner: &ContextInner,
    state: &mut ContextState,
    record: PendingDecode,
    decoded: Decoded,
) {
    let PendingDecode {
        name,
        handle,
        load,
        format,
        frequency,
        ..
    } = record;
    match decoded {
        Ok((data, frames, loop_points)) => {
            let Some(entry) = state.buffers.get_mut(handle) else {
                load.settle(LoadStatus::Failed(FernSonicError::NotFound(format!(
                    "buffer {name:?} disappeared during load"
                ))));
                return;
            };
            if let Err(err) = inner.backend.buffer_data(entry.raw, format, &data, frequency) {
                log::warn!("upload of {name:?} failed: {err}");
                load.settle(LoadStatus::Failed(err.into()));
                return;
            }
            if inner.has_ext(Extension::LoopPoints) {
                if let Err(err) = inner.backend.buffer_set_loop_points(
                    entry.raw,
                    loop_points.0 as u32,
                    loop_points.1 as u32,
                ) {
                    log::warn!("failed to set loop points on {name:?}: {err}");
                }
            }
            entry.frames = frames;
            entry.loop_points = loop_points;
            load.settle(LoadStatus::Ready);
            log::debug!("async-loaded buffer {name:?} ({frames} frames)");
        }
        Err(err) => {
            log::warn!("async load of {name:?} failed: {err}");
            load.settle(LoadStatus::Failed(err));
        }
    }
}
