use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::store::{FileInfo, InputFs, ReadSeek, UploadFs, Uploader};

/// Default minimum part size, matching typical object-store limits.
pub const DEFAULT_MIN_PART: usize = 8 << 20;

/// Object store backed by a local directory. Etags are derived from the
/// file length and modification time, so any rewrite is observable.
pub struct DirFs {
    root: PathBuf,
    min_part_size: usize,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirFs {
            root: root.into(),
            min_part_size: DEFAULT_MIN_PART,
        }
    }

    /// Lower the multipart threshold; tests use this to exercise the
    /// multi-part paths with small data.
    pub fn with_min_part_size(mut self, n: usize) -> Self {
        self.min_part_size = n.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Format(format!("unsafe object path {path:?}")));
        }
        Ok(self.root.join(rel))
    }

    fn etag_of(path: &str, md: &fs::Metadata) -> String {
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        let mut h = blake3::Hasher::new();
        h.update(path.as_bytes());
        h.update(&md.len().to_le_bytes());
        h.update(&mtime.to_le_bytes());
        let hash = h.finalize();
        hex::encode(&hash.as_bytes()[..16])
    }
}

impl InputFs for DirFs {
    fn open(&self, path: &str) -> Result<Box<dyn ReadSeek>> {
        let f = File::open(self.resolve(path)?)?;
        Ok(Box::new(f))
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let md = fs::metadata(self.resolve(path)?)?;
        let last_modified = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Ok(FileInfo {
            path: path.to_string(),
            etag: Self::etag_of(path, &md),
            size: md.len() as i64,
            last_modified,
        })
    }
}

impl UploadFs for DirFs {
    fn write_file(&self, path: &str, buf: &[u8]) -> Result<String> {
        let dst = self.resolve(path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = NamedTempFile::new_in(
            dst.parent().unwrap_or_else(|| Path::new(".")),
        )?;
        tmp.write_all(buf)?;
        tmp.flush()?;
        tmp.persist(&dst)
            .map_err(|e| Error::Io(e.error))?;
        Ok(self.stat(path)?.etag)
    }

    fn create(&self, path: &str) -> Result<Box<dyn Uploader>> {
        let dst = self.resolve(path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(DirUploader {
            dst,
            spool: tempfile::tempdir_in(&self.root)?,
            parts: Vec::new(),
            min_part_size: self.min_part_size,
            size: 0,
            closed: false,
        }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path)?)?;
        Ok(())
    }
}

/// Local filesystems have no multipart API, so parts spool into a private
/// temp directory and concatenate on close.
struct DirUploader {
    dst: PathBuf,
    spool: tempfile::TempDir,
    parts: Vec<(i64, PathBuf)>,
    min_part_size: usize,
    size: i64,
    closed: bool,
}

impl Uploader for DirUploader {
    fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    fn upload(&mut self, part: i64, contents: &[u8]) -> Result<()> {
        assert!(!self.closed, "upload after close");
        if part <= 0 {
            return Err(Error::Format(format!("part number {part} must be positive")));
        }
        let p = self.spool.path().join(format!("part-{part:08}"));
        fs::write(&p, contents)?;
        self.parts.push((part, p));
        self.size += contents.len() as i64;
        Ok(())
    }

    fn close(&mut self, final_bytes: &[u8]) -> Result<()> {
        assert!(!self.closed, "double close");
        self.closed = true;
        self.parts.sort_by_key(|(n, _)| *n);
        let mut tmp = NamedTempFile::new_in(
            self.dst.parent().unwrap_or_else(|| Path::new(".")),
        )?;
        let mut buf = vec![0u8; 1 << 16];
        for (_, p) in &self.parts {
            let mut src = File::open(p)?;
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                tmp.write_all(&buf[..n])?;
            }
        }
        tmp.write_all(final_bytes)?;
        tmp.flush()?;
        self.size += final_bytes.len() as i64;
        tmp.persist(&self.dst).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn size(&self) -> i64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_stat_etag_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let etag = fs.write_file("db/objects/a", b"hello").unwrap();
        let info = fs.stat("db/objects/a").unwrap();
        assert_eq!(info.etag, etag);
        assert_eq!(info.size, 5);
        assert_eq!(fs.etag("db/objects/a", &info).unwrap(), etag);
    }

    #[test]
    fn uploader_concatenates_parts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path()).with_min_part_size(4);
        let mut up = fs.create("out/pack").unwrap();
        // out-of-order part numbers still land in order
        up.upload(2, b"bbbb").unwrap();
        up.upload(1, b"aaaa").unwrap();
        up.close(b"cc").unwrap();
        assert_eq!(up.size(), 10);

        let mut r = fs.open("out/pack").unwrap();
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"aaaabbbbcc");
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        assert!(fs.open("../evil").is_err());
        assert!(fs.write_file("/abs", b"x").is_err());
    }
}
