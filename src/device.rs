//! Playback devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{BackendDevice, Extension};
use crate::context::Context;
use crate::devmgr::DeviceManager;
use crate::error::{FernSonicError, Result};

pub(crate) struct DeviceInner {
    pub backend: Box<dyn BackendDevice>,
    pub manager: DeviceManager,
    /// Living contexts on this device. A context removes itself on destroy.
    pub contexts: Mutex<Vec<Context>>,
    pub closed: AtomicBool,
}

impl DeviceInner {
    pub fn new(manager: DeviceManager, backend: Box<dyn BackendDevice>) -> Self {
        Self {
            backend,
            manager,
            contexts: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remove_context(&self, context: &Context) {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.retain(|c| c != context);
    }
}

/// Handle to an open playback device. Owns its contexts; closing requires
/// destroying them first.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Device {}

impl Device {
    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(FernSonicError::StaleHandle("device was closed".into()))
        } else {
            Ok(())
        }
    }

    pub fn manager(&self) -> DeviceManager {
        self.inner.manager.clone()
    }

    /// Device name; `full` selects the complete name where the backend
    /// distinguishes.
    pub fn name(&self, full: bool) -> String {
        self.inner.backend.name(full)
    }

    pub fn query_extension(&self, extension: Extension) -> bool {
        self.inner.backend.query_extension(extension)
    }

    /// `(major, minor)` backend API version.
    pub fn version(&self) -> (u16, u16) {
        self.inner.backend.version()
    }

    /// `(major, minor)` EFX version; `(0, 0)` when EFX is unsupported.
    pub fn efx_version(&self) -> (u16, u16) {
        self.inner.backend.efx_version()
    }

    /// Playback frequency in hz.
    pub fn frequency(&self) -> u32 {
        self.inner.backend.frequency()
    }

    /// Auxiliary sends per source; 0 when EFX is unsupported.
    pub fn max_auxiliary_sends(&self) -> u32 {
        self.inner.backend.max_auxiliary_sends()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.backend.is_connected()
    }

    /// Available HRTF names, in backend id order. Empty without the HRTF
    /// capability.
    pub fn hrtf_names(&self) -> Vec<String> {
        self.inner.backend.hrtf_names()
    }

    pub fn is_hrtf_enabled(&self) -> bool {
        self.inner.backend.is_hrtf_enabled()
    }

    pub fn current_hrtf(&self) -> Option<String> {
        self.inner.backend.current_hrtf()
    }

    /// Resets the device with `(attribute, value)` pairs. Requires the HRTF
    /// capability.
    pub fn reset(&self, attributes: &[(i32, i32)]) -> Result<()> {
        self.check_open()?;
        if !self.query_extension(Extension::Hrtf) {
            return Err(FernSonicError::NotSupported("device reset".into()));
        }
        self.inner.backend.reset(attributes)?;
        Ok(())
    }

    /// Pauses DSP processing for all contexts of the device. Not reference
    /// counted: one resume undoes any number of pauses.
    pub fn pause_dsp(&self) -> Result<()> {
        self.check_open()?;
        if !self.query_extension(Extension::PauseDevice) {
            return Err(FernSonicError::NotSupported("device DSP pause".into()));
        }
        self.inner.backend.pause_dsp()?;
        Ok(())
    }

    pub fn resume_dsp(&self) -> Result<()> {
        self.check_open()?;
        self.inner.backend.resume_dsp()?;
        Ok(())
    }

    /// Creates a new context on this device.
    pub fn create_context(&self) -> Result<Context> {
        self.check_open()?;
        let backend_ctx = self.inner.backend.create_context()?;
        // Full rollback on constructor failure: the backend context must not
        // outlive an error return.
        match Context::new(self.clone(), backend_ctx) {
            Ok(context) => {
                let mut contexts = self
                    .inner
                    .contexts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                contexts.push(context.clone());
                Ok(context)
            }
            Err((backend_ctx, err)) => {
                if let Err(destroy_err) = backend_ctx.destroy() {
                    log::warn!("rollback of failed context creation failed: {destroy_err}");
                }
                Err(err)
            }
        }
    }

    /// Closes the device. Fails while any context is still alive.
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        {
            let contexts = self
                .inner
                .contexts
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !contexts.is_empty() {
                return Err(FernSonicError::InUse(format!(
                    "device still has {} context(s)",
                    contexts.len()
                )));
            }
        }
        self.inner.backend.close()?;
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name(true))
            .finish()
    }
}
