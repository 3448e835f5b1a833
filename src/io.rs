//! Pluggable resource I/O.
//!
//! Decoders read from [`ByteStream`]s handed out by a [`FileIoFactory`]. The
//! default factory opens plain binary files; applications mount archives or
//! network stores by installing their own factory on the
//! [`crate::devmgr::DeviceManager`].

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

/// A forward-readable, seekable byte source.
///
/// `Sync` is required so streams can be handed to decoders that run on the
/// background worker.
pub trait ByteStream: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> ByteStream for T {}

/// Opens named resources for decoding.
pub trait FileIoFactory: Send + Sync {
    /// Opens a read-only stream for `name`, or `None` if it does not exist.
    fn open_file(&self, name: &str) -> Option<Box<dyn ByteStream>>;
}

/// The default factory: `name` is a filesystem path.
pub struct DefaultFileIo;

impl FileIoFactory for DefaultFileIo {
    fn open_file(&self, name: &str) -> Option<Box<dyn ByteStream>> {
        match File::open(Path::new(name)) {
            Ok(file) => Some(Box::new(file)),
            Err(err) => {
                log::debug!("failed to open {name:?}: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_factory_opens_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blip.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"data")
            .unwrap();

        let io = DefaultFileIo;
        let mut stream = io.open_file(path.to_str().unwrap()).unwrap();
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"data");

        assert!(io.open_file(dir.path().join("absent").to_str().unwrap()).is_none());
    }
}
