//! Single-stream packfile writer: frames aligned chunks, tracks block
//! metadata, uploads full parts in the background, and emits the trailer
//! on close.

use std::mem;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver};
use tracing::debug;

use super::sparse::{FieldPath, SparseIndex};
use super::trailer::{BlockDesc, Trailer};
use crate::codec::frame::{append_frame, append_raw_frame};
use crate::codec::{must_compress, Compressor};
use crate::error::{Error, Result};
use crate::sdr::{OwnedDatum, BVM};
use crate::store::Uploader;

/// Sink the row chunker drives: aligned chunks, per-path time ranges, and
/// explicit metadata flushes delimiting blocks.
pub trait BlockSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    fn set_min_max(&mut self, path: &[String], min: i64, max: i64);

    fn flush_meta(&mut self) -> Result<()>;
}

impl<T: BlockSink + ?Sized> BlockSink for &mut T {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        (**self).write_chunk(chunk)
    }
    fn set_min_max(&mut self, path: &[String], min: i64, max: i64) {
        (**self).set_min_max(path, min, max)
    }
    fn flush_meta(&mut self) -> Result<()> {
        (**self).flush_meta()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PathRange {
    pub path: FieldPath,
    pub min: i64,
    pub max: i64,
}

/// Pointwise union: min-of-mins, max-of-maxes; paths present on one side
/// only are carried through unchanged.
pub(crate) fn union_ranges(dst: &mut Vec<PathRange>, src: &[PathRange]) {
    for r in src {
        match dst.iter_mut().find(|d| d.path == r.path) {
            Some(d) => {
                d.min = d.min.min(r.min);
                d.max = d.max.max(r.max);
            }
            None => dst.push(r.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockPart {
    /// Byte offset of the block's first frame.
    pub offset: i64,
    pub chunks: usize,
    pub ranges: Vec<PathRange>,
}

/// Stable in-place merge of undersized blocks. A block grows forward
/// while it is below `min` chunks, or while everything after it could not
/// reach `min` on its own (so no undersized tail survives).
pub(crate) fn coalesce(blocks: &mut Vec<BlockPart>, min: usize) {
    if min <= 1 || blocks.len() <= 1 {
        return;
    }
    let mut rest: usize = blocks.iter().map(|b| b.chunks).sum();
    let mut out: Vec<BlockPart> = Vec::with_capacity(blocks.len());
    let mut iter = blocks.drain(..);
    let mut cur = iter.next().expect("non-empty");
    rest -= cur.chunks;
    for b in iter {
        if cur.chunks < min || rest < min {
            rest -= b.chunks;
            cur.chunks += b.chunks;
            union_ranges(&mut cur.ranges, &b.ranges);
        } else {
            let prev = mem::replace(&mut cur, b);
            rest -= cur.chunks;
            out.push(prev);
        }
    }
    out.push(cur);
    *blocks = out;
}

/// One background part upload per writer: a single-slot result channel
/// guarantees at most one upload is in flight, and the next launch
/// surfaces the previous result first.
pub(crate) struct BackgroundPart {
    uploader: Arc<Mutex<Box<dyn Uploader>>>,
    pending: Option<Receiver<(Result<()>, Vec<u8>)>>,
}

impl BackgroundPart {
    pub(crate) fn new(uploader: Arc<Mutex<Box<dyn Uploader>>>) -> Self {
        BackgroundPart {
            uploader,
            pending: None,
        }
    }

    /// Await the outstanding upload, if any, returning its buffer for
    /// reuse.
    pub(crate) fn wait(&mut self) -> Result<Option<Vec<u8>>> {
        match self.pending.take() {
            None => Ok(None),
            Some(rx) => {
                let (res, buf) = rx
                    .recv()
                    .map_err(|_| Error::Format("upload worker vanished".to_string()))?;
                res?;
                Ok(Some(buf))
            }
        }
    }

    /// Upload `buf` as `part` in the background. Any previous upload is
    /// awaited first so its error cannot be lost.
    pub(crate) fn launch(&mut self, part: i64, buf: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let prev = self.wait()?;
        let (tx, rx) = bounded(1);
        let uploader = Arc::clone(&self.uploader);
        std::thread::spawn(move || {
            let res = uploader
                .lock()
                .map_err(|_| Error::Format("uploader mutex poisoned".to_string()))
                .and_then(|mut u| u.upload(part, &buf));
            let _ = tx.send((res, buf));
        });
        self.pending = Some(rx);
        Ok(prev)
    }
}

#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub algo: String,
    /// Exact size of every incoming chunk.
    pub input_align: usize,
    /// Part size; 0 falls back to the uploader's minimum part size.
    pub target_size: usize,
    /// Blocks below this chunk count are merged at close.
    pub min_chunks_per_block: usize,
    /// Skip the begin-version-marker check on block-leading chunks.
    pub skip_checks: bool,
}

impl WriterConfig {
    pub fn new(algo: &str, input_align: usize) -> Self {
        WriterConfig {
            algo: algo.to_string(),
            input_align,
            target_size: 0,
            min_chunks_per_block: 1,
            skip_checks: false,
        }
    }

    pub fn min_chunks(mut self, n: usize) -> Self {
        // zero would disable coalescing entirely; clamp instead of
        // letting it reach any divisor
        self.min_chunks_per_block = n.max(1);
        self
    }

    pub fn target(mut self, n: usize) -> Self {
        self.target_size = n;
        self
    }
}

pub struct CompressionWriter {
    cfg: WriterConfig,
    comp: Box<dyn Compressor>,
    uploader: Arc<Mutex<Box<dyn Uploader>>>,
    bg: BackgroundPart,
    buf: Vec<u8>,
    alt: Option<Vec<u8>>,
    /// Bytes already handed to the uploader; `buf[0]` sits at this offset.
    flushed: i64,
    next_part: i64,
    blocks: Vec<BlockPart>,
    /// Leading blocks adopted verbatim by a fast prepend; exempt from
    /// coalescing and already summarized in `start_sparse`.
    frozen: usize,
    start_sparse: Option<SparseIndex>,
    pending_chunks: usize,
    block_start: i64,
    ranges: Vec<PathRange>,
    consts: Vec<(String, OwnedDatum)>,
    min_part: usize,
    target: usize,
}

impl CompressionWriter {
    pub fn new(uploader: Box<dyn Uploader>, cfg: WriterConfig) -> Result<Self> {
        let comp = must_compress(&cfg.algo)?;
        let min_part = uploader.min_part_size();
        let target = if cfg.target_size == 0 {
            min_part
        } else {
            cfg.target_size.max(min_part)
        };
        let uploader: Arc<Mutex<Box<dyn Uploader>>> = Arc::new(Mutex::new(uploader));
        Ok(CompressionWriter {
            comp,
            bg: BackgroundPart::new(Arc::clone(&uploader)),
            uploader,
            buf: Vec::new(),
            alt: None,
            flushed: 0,
            next_part: 1,
            blocks: Vec::new(),
            frozen: 0,
            start_sparse: None,
            pending_chunks: 0,
            block_start: 0,
            ranges: Vec::new(),
            consts: Vec::new(),
            min_part,
            target,
            cfg,
        })
    }

    pub fn algo(&self) -> &str {
        &self.cfg.algo
    }

    pub fn input_align(&self) -> usize {
        self.cfg.input_align
    }

    /// Record a field value constant across the whole packfile.
    pub fn set_const(&mut self, name: &str, v: OwnedDatum) {
        self.consts.push((name.to_string(), v));
    }

    /// Current absolute offset in the compressed stream.
    fn written(&self) -> i64 {
        self.flushed + self.buf.len() as i64
    }

    fn maybe_upload(&mut self) -> Result<()> {
        if self.buf.len() < self.target {
            return Ok(());
        }
        let part = self.next_part;
        self.next_part += 1;
        let next = match self.alt.take() {
            Some(mut b) => {
                b.clear();
                b
            }
            None => Vec::with_capacity(self.target),
        };
        let full = mem::replace(&mut self.buf, next);
        self.flushed += full.len() as i64;
        debug!(part, bytes = full.len(), "uploading packfile part");
        if let Some(prev) = self.bg.launch(part, full)? {
            self.alt = Some(prev);
        }
        Ok(())
    }

    /// Write the raw (already-compressed) frame payload for one chunk.
    pub fn write_compressed(&mut self, frame_payload: &[u8]) -> Result<()> {
        append_raw_frame(&mut self.buf, frame_payload)?;
        self.pending_chunks += 1;
        self.maybe_upload()
    }

    /// Splice a compatible prefix of an existing packfile without
    /// recompressing: complete upload parts are copied verbatim and their
    /// blocks adopted. Returns the number of source bytes consumed.
    pub fn write_start(&mut self, src: &mut dyn std::io::Read, old: &Trailer) -> Result<u64> {
        if old.algo != self.cfg.algo || old.chunk_size() != self.cfg.input_align {
            return Ok(0);
        }
        assert!(
            self.blocks.is_empty() && self.buf.is_empty() && self.pending_chunks == 0,
            "write_start on a dirty writer"
        );
        let min = self.cfg.min_chunks_per_block;
        let mut j = 0;
        while j < old.blocks.len() && old.blocks[j].chunks >= min {
            j += 1;
        }
        let end = if j == 0 {
            0
        } else if j < old.blocks.len() {
            old.blocks[j].offset
        } else {
            old.offset
        };
        if (end as usize) < self.min_part {
            return Ok(0);
        }
        debug!(blocks = j, bytes = end, "prepending packfile prefix");
        let mut remaining = end as usize;
        let mut tmp = vec![0u8; 1 << 16];
        while remaining > 0 {
            let n = tmp.len().min(remaining);
            src.read_exact(&mut tmp[..n])?;
            self.buf.extend_from_slice(&tmp[..n]);
            remaining -= n;
            self.maybe_upload()?;
        }
        self.blocks = old.blocks[..j]
            .iter()
            .map(|b| BlockPart {
                offset: b.offset,
                chunks: b.chunks,
                ranges: Vec::new(),
            })
            .collect();
        self.frozen = j;
        self.start_sparse = Some(old.sparse.trim(j));
        self.block_start = end;
        Ok(end as u64)
    }

    pub fn close(mut self) -> Result<Trailer> {
        self.bg.wait()?;
        assert_eq!(self.pending_chunks, 0, "unflushed chunks at close");
        let mut tail = self.blocks.split_off(self.frozen);
        if !tail.is_empty() {
            coalesce(&mut tail, self.cfg.min_chunks_per_block);
        }
        let mut sparse = self.start_sparse.take().unwrap_or_default();
        for (name, v) in self.consts.drain(..) {
            sparse.set_const(&name, v);
        }
        for b in &tail {
            for r in &b.ranges {
                sparse.push(&r.path, r.min, r.max);
            }
            sparse.bump();
        }
        self.blocks.append(&mut tail);

        let mut t = Trailer::new(&self.cfg.algo, self.cfg.input_align.trailing_zeros());
        t.offset = self.written();
        t.sparse = sparse;
        t.blocks = self
            .blocks
            .iter()
            .map(|b| BlockDesc {
                offset: b.offset,
                chunks: b.chunks,
            })
            .collect();
        t.encode_onto(&mut self.buf);
        let mut u = self
            .uploader
            .lock()
            .map_err(|_| Error::Format("uploader mutex poisoned".to_string()))?;
        u.close(&self.buf)?;
        debug!(size = u.size(), blocks = t.blocks.len(), "packfile closed");
        Ok(t)
    }
}

impl BlockSink for CompressionWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() != self.cfg.input_align {
            return Err(Error::Format(format!(
                "chunk is {} bytes, writer requires {}",
                chunk.len(),
                self.cfg.input_align
            )));
        }
        if self.pending_chunks == 0 && !self.cfg.skip_checks && !chunk.starts_with(&BVM) {
            return Err(Error::Format(
                "block-leading chunk must begin with a version marker".to_string(),
            ));
        }
        append_frame(&mut self.buf, self.comp.as_mut(), chunk)?;
        self.pending_chunks += 1;
        self.maybe_upload()
    }

    fn set_min_max(&mut self, path: &[String], min: i64, max: i64) {
        union_ranges(
            &mut self.ranges,
            &[PathRange {
                path: path.to_vec(),
                min,
                max,
            }],
        );
    }

    fn flush_meta(&mut self) -> Result<()> {
        let cur = self.written();
        if self.pending_chunks == 0 {
            assert!(
                self.ranges.is_empty() && self.block_start == cur,
                "flush with no chunks but lastblock {} != offset {cur}",
                self.block_start
            );
            return Ok(());
        }
        self.blocks.push(BlockPart {
            offset: self.block_start,
            chunks: self.pending_chunks,
            ranges: mem::take(&mut self.ranges),
        });
        self.block_start = cur;
        self.pending_chunks = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::BlockDecoder;
    use crate::store_fs::DirFs;
    use crate::store::{InputFs, UploadFs};

    fn parts(chunks: &[usize]) -> Vec<BlockPart> {
        chunks
            .iter()
            .map(|&c| BlockPart {
                offset: 0,
                chunks: c,
                ranges: Vec::new(),
            })
            .collect()
    }

    fn counts(blocks: &[BlockPart]) -> Vec<usize> {
        blocks.iter().map(|b| b.chunks).collect()
    }

    #[test]
    fn coalesce_scenarios() {
        let mut b = parts(&[4, 3, 5]);
        coalesce(&mut b, 5);
        assert_eq!(counts(&b), vec![7, 5]);

        let mut b = parts(&[3, 3, 3, 3, 3, 3, 3]);
        coalesce(&mut b, 9);
        assert_eq!(counts(&b), vec![9, 12]);

        let mut b = parts(&[10, 3, 10, 3]);
        coalesce(&mut b, 5);
        assert_eq!(counts(&b), vec![10, 16]);
    }

    #[test]
    fn coalesce_preserves_total_and_order() {
        let input = [1usize, 9, 2, 8, 3, 7, 1, 1, 1];
        let total: usize = input.iter().sum();
        let mut b = parts(&input);
        for (i, blk) in b.iter_mut().enumerate() {
            blk.ranges.push(PathRange {
                path: vec![format!("f{i}")],
                min: i as i64,
                max: i as i64 + 1,
            });
        }
        coalesce(&mut b, 4);
        assert_eq!(b.iter().map(|x| x.chunks).sum::<usize>(), total);
        for blk in &b {
            assert!(blk.chunks >= 4);
        }
        // ranges survived the merges
        let paths: usize = b.iter().map(|x| x.ranges.len()).sum();
        assert_eq!(paths, input.len());
    }

    #[test]
    fn coalesce_small_total_merges_everything() {
        let mut b = parts(&[1, 1]);
        coalesce(&mut b, 100);
        assert_eq!(counts(&b), vec![2]);
    }

    fn bvm_chunk(align: usize, fill: u8) -> Vec<u8> {
        let mut c = vec![fill; align];
        c[..4].copy_from_slice(&BVM);
        c
    }

    #[test]
    fn write_blocks_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path()).with_min_part_size(1 << 10);
        let align = 1 << 9;
        let cfg = WriterConfig::new("zstd", align).min_chunks(1);
        let mut w =
            CompressionWriter::new(fs.create("db/pack0").unwrap(), cfg).unwrap();
        w.set_const("tenant", OwnedDatum::String("t1".into()));
        for blk in 0..4 {
            for i in 0..3u8 {
                w.write_chunk(&bvm_chunk(align, blk * 16 + i)).unwrap();
            }
            w.set_min_max(&[String::from("ts")], blk as i64 * 100, blk as i64 * 100 + 99);
            w.flush_meta().unwrap();
        }
        let t = w.close().unwrap();
        assert_eq!(t.blocks.len(), 4);
        assert_eq!(t.decompressed_size(), (12 * align) as i64);
        assert_eq!(t.sparse.blocks(), 4);
        assert_eq!(
            t.sparse.const_val("tenant"),
            Some(&OwnedDatum::String("t1".into()))
        );

        // reopen: trailer from the tail, then decode all the data
        let info = fs.stat("db/pack0").unwrap();
        let mut f = fs.open("db/pack0").unwrap();
        let got = Trailer::read_from(&mut f, info.size).unwrap();
        assert_eq!(got, t);

        use std::io::{Read, Seek, SeekFrom};
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut data = vec![0u8; got.offset as usize];
        f.read_exact(&mut data).unwrap();
        let mut dec = BlockDecoder::new(&got.algo, got.block_shift).unwrap();
        let mut out = vec![0u8; got.decompressed_size() as usize];
        let mut r: &[u8] = &data;
        dec.decompress(&mut r, &mut out).unwrap();
        assert_eq!(&out[..4], &BVM);
    }

    #[test]
    fn background_parts_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path()).with_min_part_size(256);
        let align = 256;
        let mut cfg = WriterConfig::new("zstd-nocrc", align).target(256);
        cfg.skip_checks = true;
        let mut w = CompressionWriter::new(fs.create("big").unwrap(), cfg).unwrap();
        // incompressible-ish chunks force several parts
        for i in 0..64u32 {
            let chunk: Vec<u8> = (0..align as u32)
                .map(|j| ((i * 131 + j * 31) % 251) as u8)
                .collect();
            w.write_chunk(&chunk).unwrap();
            w.flush_meta().unwrap();
        }
        let t = w.close().unwrap();
        assert_eq!(t.decompressed_size(), (64 * align) as i64);
        let info = fs.stat("big").unwrap();
        // data + trailer present and self-consistent
        let mut f = fs.open("big").unwrap();
        let got = Trailer::read_from(&mut f, info.size).unwrap();
        assert_eq!(got.offset, t.offset);
        assert!(info.size > got.offset);
    }

    #[test]
    fn unaligned_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let mut w = CompressionWriter::new(
            fs.create("p").unwrap(),
            WriterConfig::new("zstd", 1024),
        )
        .unwrap();
        assert!(w.write_chunk(&[0u8; 100]).is_err());
    }

    #[test]
    fn missing_version_marker_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let mut w = CompressionWriter::new(
            fs.create("p").unwrap(),
            WriterConfig::new("zstd", 256),
        )
        .unwrap();
        assert!(w.write_chunk(&[0u8; 256]).is_err());
    }
}
