use std::io::{Read, Seek};

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub etag: String,
    pub size: i64,
    /// Microseconds since the Unix epoch.
    pub last_modified: i64,
}

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Read side of an object store.
pub trait InputFs: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn ReadSeek>>;

    fn stat(&self, path: &str) -> Result<FileInfo>;

    /// The etag a fresh read of `path` would observe; used to detect
    /// backing-store mutation between listing and reading.
    fn etag(&self, path: &str, info: &FileInfo) -> Result<String> {
        let _ = path;
        Ok(info.etag.clone())
    }
}

/// A multipart object upload. Part numbers are monotonically positive;
/// parts smaller than `min_part_size` are only permitted as the terminal
/// `close` bytes.
pub trait Uploader: Send {
    fn min_part_size(&self) -> usize;

    fn upload(&mut self, part: i64, contents: &[u8]) -> Result<()>;

    fn close(&mut self, final_bytes: &[u8]) -> Result<()>;

    /// Total object size observed so far (final after `close`).
    fn size(&self) -> i64;
}

/// Read/write object store.
pub trait UploadFs: InputFs {
    /// Atomically overwrite `path`, returning the new etag.
    fn write_file(&self, path: &str, buf: &[u8]) -> Result<String>;

    fn create(&self, path: &str) -> Result<Box<dyn Uploader>>;

    fn remove(&self, path: &str) -> Result<()>;
}
