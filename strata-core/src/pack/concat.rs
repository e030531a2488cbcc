//! Byte-level splicing of compatible packfiles: frames are copied
//! verbatim, block offsets are rebased, and one merged trailer is written
//! at the end. No recompression happens anywhere on this path.

use tracing::debug;

use super::sparse::SparseIndex;
use super::trailer::{BlockDesc, Trailer, TRAILER_VERSION};
use crate::error::{Error, Result};
use crate::index::object::Descriptor;
use crate::store::UploadFs;

pub struct Concat {
    algo: String,
    block_shift: u32,
    blocks: Vec<BlockDesc>,
    sparse: SparseIndex,
    inputs: Vec<(String, String, i64)>, // path, etag, data length
    offset: i64,
}

impl Concat {
    pub fn new() -> Self {
        Concat {
            algo: String::new(),
            block_shift: 0,
            blocks: Vec::new(),
            sparse: SparseIndex::default(),
            inputs: Vec::new(),
            offset: 0,
        }
    }

    pub fn inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Bytes of frame data accumulated so far.
    pub fn data_len(&self) -> i64 {
        self.offset
    }

    /// Add a packfile. Fails when the codec, trailer version, chunk size,
    /// or sparse field sets are incompatible; on failure the builder is
    /// unchanged.
    pub fn add(&mut self, desc: &Descriptor) -> Result<()> {
        let t = &desc.trailer;
        if t.version != TRAILER_VERSION {
            return Err(Error::Obsolete(t.version));
        }
        if self.inputs.is_empty() {
            self.algo = t.algo.clone();
            self.block_shift = t.block_shift;
        } else if self.algo != t.algo || self.block_shift != t.block_shift {
            return Err(Error::Format(format!(
                "cannot concatenate {}/{} packfile onto {}/{}",
                t.algo, t.block_shift, self.algo, self.block_shift
            )));
        }
        let mut merged = self.sparse.clone();
        merged.append(&t.sparse)?;
        self.sparse = merged;
        for b in &t.blocks {
            self.blocks.push(BlockDesc {
                offset: self.offset + b.offset,
                chunks: b.chunks,
            });
        }
        self.inputs
            .push((desc.info.path.clone(), desc.info.etag.clone(), t.offset));
        self.offset += t.offset;
        Ok(())
    }

    /// Stream every input into `name`, verifying etags still match, and
    /// finish with the merged trailer.
    pub fn run(self, fs: &dyn UploadFs, name: &str) -> Result<Trailer> {
        let mut up = fs.create(name)?;
        let min_part = up.min_part_size();
        let mut part = 1i64;
        let mut buf: Vec<u8> = Vec::new();
        let mut tmp = vec![0u8; 1 << 16];

        for (path, etag, data_len) in &self.inputs {
            let info = fs.stat(path)?;
            let got = fs.etag(path, &info)?;
            if got != *etag {
                return Err(Error::EtagChanged {
                    path: path.clone(),
                    want: etag.clone(),
                    got,
                });
            }
            let mut src = fs.open(path)?;
            let mut remaining = *data_len as usize;
            while remaining > 0 {
                let n = tmp.len().min(remaining);
                src.read_exact(&mut tmp[..n])?;
                buf.extend_from_slice(&tmp[..n]);
                remaining -= n;
                if buf.len() >= min_part {
                    up.upload(part, &buf)?;
                    part += 1;
                    buf.clear();
                }
            }
        }

        let mut t = Trailer::new(&self.algo, self.block_shift);
        t.offset = self.offset;
        t.sparse = self.sparse;
        t.blocks = self.blocks;
        t.encode_onto(&mut buf);
        up.close(&buf)?;
        debug!(name, inputs = self.inputs.len(), size = up.size(), "concatenated packfiles");
        Ok(t)
    }
}

impl Default for Concat {
    fn default() -> Self {
        Concat::new()
    }
}
