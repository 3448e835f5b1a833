//! Application callbacks.

use crate::backend::{ChannelConfig, SampleType};
use crate::device::Device;
use crate::source::Source;

/// Receives notifications from a context. All methods default to no-ops, so
/// implementations only override what they care about.
///
/// `buffer_loading` may be invoked from the background worker thread for
/// asynchronous loads; everything else fires on the thread driving the
/// context API.
#[allow(unused_variables)]
pub trait MessageHandler: Send + Sync {
    /// The device backing the context is gone. Reported from
    /// [`crate::context::Context::update`] when the backend supports
    /// disconnect detection.
    fn device_disconnected(&self, device: Device) {}

    /// A source reached the end of its buffer or stream on its own.
    fn source_stopped(&self, source: Source) {}

    /// A source was stopped by voice eviction or a group-wide stop. The
    /// source is already detached when this fires.
    fn source_force_stopped(&self, source: Source) {}

    /// A buffer finished decoding and is about to be uploaded.
    fn buffer_loading(
        &self,
        name: &str,
        channels: ChannelConfig,
        sample_type: SampleType,
        frequency: u32,
        data: &[u8],
    ) {
    }

    /// A resource was not found; return a substitute name to retry with, or
    /// `None` to give up. Repeated substitutions re-invoke this with the
    /// newest failing name, while the buffer cache keys stay on the original.
    fn resource_not_found(&self, name: &str) -> Option<String> {
        None
    }
}

/// Handler that ignores everything; used when none is installed.
pub(crate) struct NullMessageHandler;

impl MessageHandler for NullMessageHandler {}
