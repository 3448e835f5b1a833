//! The device manager.
//!
//! One manager exists per process (see [`DeviceManager::get`]); tests and
//! embedders can build additional managers over their own backend drivers
//! with [`DeviceManager::with_driver`]. Besides opening devices, the manager
//! owns the decoder-factory registry, the file I/O factory slot, and the two
//! current-context slots (process-wide and per-thread).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::thread::ThreadId;

use crate::backend::null::NullDriver;
use crate::backend::{BackendDriver, Extension};
use crate::context::Context;
use crate::decoder::DecoderFactory;
use crate::device::{Device, DeviceInner};
use crate::error::{FernSonicError, Result};
use crate::io::{DefaultFileIo, FileIoFactory};

pub(crate) struct CurrentSlots {
    pub process: Option<Context>,
    pub thread: HashMap<ThreadId, Context>,
}

pub(crate) struct ManagerInner {
    pub driver: Box<dyn BackendDriver>,
    pub decoders: Mutex<BTreeMap<String, Arc<dyn DecoderFactory>>>,
    pub file_io: Mutex<Arc<dyn FileIoFactory>>,
    /// Current-context slots. Lock order: a context's state mutex may be
    /// held when taking this lock, never the other way around.
    pub current: Mutex<CurrentSlots>,
    /// Serializes whole make-current operations.
    pub current_change: Mutex<()>,
}

impl ManagerInner {
    pub fn slots(&self) -> MutexGuard<'_, CurrentSlots> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Manages devices and process-global registries.
#[derive(Clone)]
pub struct DeviceManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

static SINGLETON: OnceLock<DeviceManager> = OnceLock::new();

impl DeviceManager {
    /// The process-wide manager, backed by the in-memory null driver. Link a
    /// hardware backend by building a manager over it with
    /// [`DeviceManager::with_driver`].
    pub fn get() -> DeviceManager {
        SINGLETON
            .get_or_init(|| DeviceManager::with_driver(Box::new(NullDriver::new())))
            .clone()
    }

    /// Builds a manager over an explicit backend driver.
    pub fn with_driver(driver: Box<dyn BackendDriver>) -> DeviceManager {
        DeviceManager {
            inner: Arc::new(ManagerInner {
                driver,
                decoders: Mutex::new(BTreeMap::new()),
                file_io: Mutex::new(Arc::new(DefaultFileIo)),
                current: Mutex::new(CurrentSlots {
                    process: None,
                    thread: HashMap::new(),
                }),
                current_change: Mutex::new(()),
            }),
        }
    }

    /// Driver-level capability query (e.g. thread-local contexts).
    pub fn query_extension(&self, extension: Extension) -> bool {
        self.inner.driver.query_extension(extension)
    }

    /// Names of the available playback devices.
    pub fn enumerate(&self) -> Vec<String> {
        self.inner.driver.enumerate()
    }

    pub fn default_device_name(&self) -> Option<String> {
        self.inner.driver.default_device_name()
    }

    /// Opens a playback device; `None` opens the default.
    pub fn open_playback(&self, name: Option<&str>) -> Result<Device> {
        let backend = self.inner.driver.open(name)?;
        Ok(Device {
            inner: Arc::new(DeviceInner::new(self.clone(), backend)),
        })
    }

    /// Registers a decoder factory. Registered factories are offered byte
    /// streams in lexicographic name order, before the built-in decoders.
    /// The returned token unregisters the factory when dropped.
    pub fn register_decoder(
        &self,
        name: &str,
        factory: Arc<dyn DecoderFactory>,
    ) -> Result<DecoderRegistration> {
        if name.is_empty() {
            return Err(FernSonicError::InvalidArgument(
                "decoder factory name is empty".into(),
            ));
        }
        let mut decoders = self.inner.decoders.lock().unwrap_or_else(|e| e.into_inner());
        if decoders.contains_key(name) {
            return Err(FernSonicError::Duplicate(format!(
                "decoder factory {name:?}"
            )));
        }
        decoders.insert(name.to_string(), factory);
        Ok(DecoderRegistration {
            manager: Arc::downgrade(&self.inner),
            name: name.to_string(),
        })
    }

    pub(crate) fn decoder_snapshot(&self) -> BTreeMap<String, Arc<dyn DecoderFactory>> {
        self.inner
            .decoders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the file I/O factory, returning the previous one.
    pub fn set_file_io_factory(&self, factory: Arc<dyn FileIoFactory>) -> Arc<dyn FileIoFactory> {
        let mut slot = self.inner.file_io.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, factory)
    }

    pub fn file_io_factory(&self) -> Arc<dyn FileIoFactory> {
        self.inner
            .file_io
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The process-wide current context, if any.
    pub fn current_context(&self) -> Option<Context> {
        self.inner.slots().process.clone()
    }

    /// The calling thread's current context, if any.
    pub fn thread_current_context(&self) -> Option<Context> {
        self.inner
            .slots()
            .thread
            .get(&std::thread::current().id())
            .cloned()
    }

    /// Makes `context` the process-wide current context (`None` clears it).
    pub fn make_current(&self, context: Option<&Context>) -> Result<()> {
        Context::make_current_on(self, context)
    }

    /// Makes `context` current for the calling thread only. Requires the
    /// thread-local-context capability.
    pub fn make_thread_current(&self, context: Option<&Context>) -> Result<()> {
        Context::make_thread_current_on(self, context)
    }
}

impl PartialEq for DeviceManager {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for DeviceManager {}

/// Keeps a decoder factory registered; dropping it unregisters.
pub struct DecoderRegistration {
    manager: Weak<ManagerInner>,
    name: String,
}

impl DecoderRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DecoderRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            let mut decoders = inner.decoders.lock().unwrap_or_else(|e| e.into_inner());
            decoders.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SharedStream;

    struct RefuseAll;
    impl DecoderFactory for RefuseAll {
        fn create_decoder(&self, _stream: SharedStream) -> Option<Box<dyn crate::decoder::Decoder>> {
            None
        }
    }

    #[test]
    fn registration_token_unregisters_on_drop() {
        let manager = DeviceManager::with_driver(Box::new(NullDriver::new()));
        let token = manager
            .register_decoder("custom", Arc::new(RefuseAll))
            .unwrap();
        assert!(manager.decoder_snapshot().contains_key("custom"));
        assert!(manager.register_decoder("custom", Arc::new(RefuseAll)).is_err());
        drop(token);
        assert!(!manager.decoder_snapshot().contains_key("custom"));
    }

    #[test]
    fn singleton_is_shared() {
        assert_eq!(DeviceManager::get(), DeviceManager::get());
    }
}
