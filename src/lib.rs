//! FernSonic — high-level audio orchestration over a positional backend.
//!
//! FernSonic turns a file-oriented, object-graph API ("play this sound,
//! loop it, fade it out, route it through this reverb") into a bounded set
//! of backend voices, disk reads, and decoded sample pages. The positional
//! backend itself (an OpenAL-family implementation) sits behind the traits
//! in [`backend`]; the in-memory [`backend::null`] driver makes the crate
//! fully usable headless.
//!
//! The usual flow: open a [`Device`] through the [`DeviceManager`], create a
//! [`Context`], make it current, then load [`Buffer`]s and play them on
//! [`Source`]s. Call [`Context::update`] regularly (30–50 times per second)
//! to drive fades, future-buffer playback, and end-of-stream notifications;
//! a per-context worker thread keeps streaming sources fed in between.

pub mod backend;
pub mod buffer;
pub mod context;
pub mod decoder;
pub mod device;
pub mod devmgr;
pub mod effect;
pub mod error;
pub mod group;
pub mod handle;
pub mod io;
pub mod listener;
pub mod math;
pub mod message;
pub mod source;

pub use backend::{
    ChannelConfig, DistanceModel, Extension, FilterParams, ReverbProperties, SampleType,
    Spatialize,
};
pub use buffer::{Buffer, FutureBuffer, LoadStatus};
pub use context::Context;
pub use decoder::{Decoder, DecoderFactory, SharedStream};
pub use device::Device;
pub use devmgr::{DecoderRegistration, DeviceManager};
pub use effect::{AuxiliaryEffectSlot, Effect};
pub use error::{FernSonicError, Result};
pub use group::SourceGroup;
pub use io::{ByteStream, FileIoFactory};
pub use listener::Listener;
pub use math::{db_to_linear, linear_to_db, Orientation, Vec3};
pub use message::MessageHandler;
pub use source::Source;
