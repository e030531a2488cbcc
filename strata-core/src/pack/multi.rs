//! Parallel multi-stream packfile writer. Each stream compresses and
//! uploads its own parts; part numbers come from a shared counter, and
//! the final block list is assembled by rebasing each stream's spans in
//! part-number order. Stream tails below the part size are coalesced
//! through a shared `unallocated` buffer.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::sparse::SparseIndex;
use super::trailer::{BlockDesc, Trailer};
use super::writer::{
    coalesce, union_ranges, BackgroundPart, BlockPart, BlockSink, PathRange, WriterConfig,
};
use crate::codec::frame::{append_frame, append_raw_frame};
use crate::codec::{must_compress, Compressor};
use crate::error::{Error, Result};
use crate::sdr::{OwnedDatum, BVM};
use crate::store::Uploader;

struct Span {
    part: i64,
    /// Block offsets relative to the span start.
    blocks: Vec<BlockPart>,
    /// Bytes this span contributes to the final object.
    outsize: usize,
}

struct MultiState {
    next_part: i64,
    spans: Vec<Span>,
    unalloc: Vec<u8>,
    unalloc_blocks: Vec<BlockPart>,
    refcount: usize,
    consts: Vec<(String, OwnedDatum)>,
}

pub struct MultiWriter {
    cfg: WriterConfig,
    uploader: Arc<Mutex<Box<dyn Uploader>>>,
    state: Arc<Mutex<MultiState>>,
    target: usize,
}

impl MultiWriter {
    pub fn new(uploader: Box<dyn Uploader>, cfg: WriterConfig) -> Result<Self> {
        // validate the codec name up front so open() cannot fail later
        must_compress(&cfg.algo)?;
        let min_part = uploader.min_part_size();
        let target = if cfg.target_size == 0 {
            min_part
        } else {
            cfg.target_size.max(min_part)
        };
        Ok(MultiWriter {
            cfg,
            uploader: Arc::new(Mutex::new(uploader)),
            state: Arc::new(Mutex::new(MultiState {
                next_part: 1,
                spans: Vec::new(),
                unalloc: Vec::new(),
                unalloc_blocks: Vec::new(),
                refcount: 0,
                consts: Vec::new(),
            })),
            target,
        })
    }

    pub fn set_const(&self, name: &str, v: OwnedDatum) {
        self.lock().consts.push((name.to_string(), v));
    }

    fn lock(&self) -> MutexGuard<'_, MultiState> {
        self.state.lock().expect("multiwriter state poisoned")
    }

    /// Open a new output stream. Streams may be driven from separate
    /// threads; each owns its compressor and background upload slot.
    pub fn open(&self) -> Result<StreamWriter> {
        let part = {
            let mut st = self.lock();
            st.refcount += 1;
            let p = st.next_part;
            st.next_part += 1;
            p
        };
        Ok(StreamWriter {
            cfg: self.cfg.clone(),
            comp: must_compress(&self.cfg.algo)?,
            state: Arc::clone(&self.state),
            bg: BackgroundPart::new(Arc::clone(&self.uploader)),
            buf: Vec::new(),
            blocks: Vec::new(),
            pending_chunks: 0,
            block_start: 0,
            ranges: Vec::new(),
            part,
            target: self.target,
        })
    }

    /// Finalize the packfile. Every stream must already be closed.
    pub fn close(self) -> Result<Trailer> {
        let mut st = self.lock();
        assert_eq!(st.refcount, 0, "multiwriter closed with open streams");

        let unalloc_blocks = mem::take(&mut st.unalloc_blocks);
        let mut tail_buf = mem::take(&mut st.unalloc);
        let synthetic = Span {
            part: st.next_part,
            blocks: unalloc_blocks,
            outsize: tail_buf.len(),
        };
        let mut spans = mem::take(&mut st.spans);
        spans.push(synthetic);
        spans.sort_by_key(|s| s.part);

        let mut blocks: Vec<BlockPart> = Vec::new();
        let mut cum = 0i64;
        for span in &mut spans {
            for b in &span.blocks {
                debug_assert!(b.offset >= 0);
                blocks.push(BlockPart {
                    offset: b.offset + cum,
                    chunks: b.chunks,
                    ranges: b.ranges.clone(),
                });
            }
            cum += span.outsize as i64;
        }

        if !blocks.is_empty() {
            coalesce(&mut blocks, self.cfg.min_chunks_per_block);
        }
        let mut sparse = SparseIndex::default();
        for (name, v) in st.consts.drain(..) {
            sparse.set_const(&name, v);
        }
        for b in &blocks {
            for r in &b.ranges {
                sparse.push(&r.path, r.min, r.max);
            }
            sparse.bump();
        }

        let mut t = Trailer::new(&self.cfg.algo, self.cfg.input_align.trailing_zeros());
        t.offset = cum;
        t.sparse = sparse;
        t.blocks = blocks
            .iter()
            .map(|b| BlockDesc {
                offset: b.offset,
                chunks: b.chunks,
            })
            .collect();
        t.encode_onto(&mut tail_buf);
        drop(st);
        let mut u = self
            .uploader
            .lock()
            .map_err(|_| Error::Format("uploader mutex poisoned".to_string()))?;
        u.close(&tail_buf)?;
        debug!(size = u.size(), blocks = t.blocks.len(), "multiwriter closed");
        Ok(t)
    }
}

/// One stream of a `MultiWriter`.
pub struct StreamWriter {
    cfg: WriterConfig,
    comp: Box<dyn Compressor>,
    state: Arc<Mutex<MultiState>>,
    bg: BackgroundPart,
    buf: Vec<u8>,
    /// Offsets relative to the current part start.
    blocks: Vec<BlockPart>,
    pending_chunks: usize,
    block_start: i64,
    ranges: Vec<PathRange>,
    part: i64,
    target: usize,
}

impl StreamWriter {
    fn lock(&self) -> MutexGuard<'_, MultiState> {
        self.state.lock().expect("multiwriter state poisoned")
    }

    /// Seal the current buffer as a full part: record its span, upload in
    /// the background, and move to a fresh part number.
    fn seal_part(&mut self) -> Result<()> {
        debug_assert!(self.pending_chunks == 0, "sealing mid-block");
        let outsize = self.buf.len();
        let blocks = mem::take(&mut self.blocks);
        let part = self.part;
        {
            let mut st = self.state.lock().expect("multiwriter state poisoned");
            st.spans.push(Span {
                part,
                blocks,
                outsize,
            });
            let next_part = st.next_part;
            st.next_part += 1;
            self.part = next_part;
        }
        let full = mem::replace(&mut self.buf, Vec::with_capacity(self.target));
        debug!(part, bytes = outsize, "uploading stream part");
        if let Some(mut prev) = self.bg.launch(part, full)? {
            prev.clear();
            self.buf = prev;
        }
        self.block_start = 0;
        Ok(())
    }

    /// Write the raw (already-compressed) frame payload for one chunk.
    pub fn write_compressed(&mut self, frame_payload: &[u8]) -> Result<()> {
        append_raw_frame(&mut self.buf, frame_payload)?;
        self.pending_chunks += 1;
        Ok(())
    }

    /// Close this stream, promoting any short tail into the shared
    /// unallocated buffer (or claiming it to form a full part).
    pub fn close(mut self) -> Result<()> {
        assert_eq!(self.pending_chunks, 0, "unflushed chunks at stream close");
        self.bg.wait()?;
        if self.buf.is_empty() && self.blocks.is_empty() {
            self.lock().refcount -= 1;
            return Ok(());
        }
        debug_assert!(
            self.blocks.first().map(|b| b.offset).unwrap_or(0) == 0,
            "span-relative offsets must start at zero"
        );
        let promote = {
            let st = self.lock();
            st.unalloc.len() + self.buf.len() >= self.target
        };
        if promote {
            // claim the shared tail: it lands after this stream's bytes
            let (mut tail, mut tail_blocks) = {
                let mut st = self.state.lock().expect("multiwriter state poisoned");
                (mem::take(&mut st.unalloc), mem::take(&mut st.unalloc_blocks))
            };
            let shift = self.buf.len() as i64;
            for b in &mut tail_blocks {
                b.offset += shift;
            }
            self.buf.append(&mut tail);
            self.blocks.append(&mut tail_blocks);
            let outsize = self.buf.len();
            let blocks = mem::take(&mut self.blocks);
            let part = self.part;
            {
                let mut st = self.lock();
                st.spans.push(Span {
                    part,
                    blocks,
                    outsize,
                });
            }
            let full = mem::take(&mut self.buf);
            self.bg.launch(part, full)?;
            self.bg.wait()?;
        } else {
            let mut st = self.state.lock().expect("multiwriter state poisoned");
            let shift = st.unalloc.len() as i64;
            for b in &mut self.blocks {
                b.offset += shift;
            }
            let buf = mem::take(&mut self.buf);
            st.unalloc.extend_from_slice(&buf);
            st.unalloc_blocks.append(&mut self.blocks);
        }
        self.lock().refcount -= 1;
        Ok(())
    }
}

impl BlockSink for StreamWriter {
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
        Ok(())
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
        let cur = self.buf.len() as i64;
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
        if self.buf.len() >= self.target {
            self.seal_part()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::BlockDecoder;
    use crate::store::{InputFs, UploadFs};
    use crate::store_fs::DirFs;

    fn bvm_chunk(align: usize, fill: u8) -> Vec<u8> {
        let mut c = vec![fill; align];
        c[..4].copy_from_slice(&BVM);
        c
    }

    #[test]
    fn two_streams_one_packfile() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path()).with_min_part_size(1 << 10);
        let align = 1 << 9;
        let cfg = WriterConfig::new("zstd", align);
        let mw = MultiWriter::new(fs.create("multi").unwrap(), cfg).unwrap();

        let mut s1 = mw.open().unwrap();
        let mut s2 = mw.open().unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for blk in 0..5i64 {
                    for c in 0..2u8 {
                        s1.write_chunk(&bvm_chunk(align, c)).unwrap();
                    }
                    s1.set_min_max(&[String::from("ts")], blk * 10, blk * 10 + 9);
                    s1.flush_meta().unwrap();
                }
                s1.close().unwrap();
            });
            scope.spawn(|| {
                for blk in 0..3i64 {
                    for c in 0..4u8 {
                        s2.write_chunk(&bvm_chunk(align, 100 + c)).unwrap();
                    }
                    s2.set_min_max(&[String::from("ts")], 100 + blk * 10, 100 + blk * 10 + 9);
                    s2.flush_meta().unwrap();
                }
                s2.close().unwrap();
            });
        });
        let t = mw.close().unwrap();
        assert_eq!(t.decompressed_size(), ((5 * 2 + 3 * 4) * align) as i64);
        assert_eq!(t.sparse.blocks(), t.blocks.len());

        // offsets strictly monotonic and the whole file decodes
        for w in t.blocks.windows(2) {
            assert!(w[0].offset < w[1].offset);
        }
        let info = fs.stat("multi").unwrap();
        let mut f = fs.open("multi").unwrap();
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
    }

    #[test]
    fn short_tails_merge_through_unallocated() {
        let dir = tempfile::tempdir().unwrap();
        // huge part size: nothing uploads until close
        let fs = DirFs::new(dir.path()).with_min_part_size(1 << 20);
        let align = 1 << 8;
        let cfg = WriterConfig::new("zstd-nocrc", align);
        let mw = MultiWriter::new(fs.create("tails").unwrap(), cfg).unwrap();
        for i in 0..3u8 {
            let mut s = mw.open().unwrap();
            s.write_chunk(&bvm_chunk(align, i)).unwrap();
            s.set_min_max(&[String::from("ts")], i as i64, i as i64 + 1);
            s.flush_meta().unwrap();
            s.close().unwrap();
        }
        let t = mw.close().unwrap();
        assert_eq!(t.decompressed_size(), (3 * align) as i64);
        let info = fs.stat("tails").unwrap();
        let mut f = fs.open("tails").unwrap();
        let got = Trailer::read_from(&mut f, info.size).unwrap();
        assert_eq!(got.blocks.len(), t.blocks.len());
    }

    #[test]
    fn empty_stream_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let mw = MultiWriter::new(
            fs.create("empty").unwrap(),
            WriterConfig::new("zstd", 256),
        )
        .unwrap();
        let s = mw.open().unwrap();
        s.close().unwrap();
        let t = mw.close().unwrap();
        assert_eq!(t.blocks.len(), 0);
        assert_eq!(t.decompressed_size(), 0);
    }
}
