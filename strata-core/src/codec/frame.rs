//! Frame envelope: every chunk is written as one self-delimiting frame,
//! `0xAE` (blob, varuint length follows) + a fixed 4-byte varuint + the
//! compressed payload. The size excludes the 5 header bytes.

use std::io::Read;

use super::{is_zion, zion, Compressor, Decompressor};
use crate::error::{Error, Result};
use crate::sdr::{put_uvarint_fixed4, TAG_BLOB_VARLEN};

pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload the 4-byte varuint can describe.
pub const MAX_FRAME_PAYLOAD: usize = (1 << 28) - 1;

/// Compress `chunk` and append it as one frame.
pub fn append_frame(dst: &mut Vec<u8>, comp: &mut dyn Compressor, chunk: &[u8]) -> Result<()> {
    let head = dst.len();
    dst.extend_from_slice(&[TAG_BLOB_VARLEN, 0, 0, 0, 0]);
    comp.compress(chunk, dst)?;
    let size = dst.len() - head - FRAME_HEADER_LEN;
    if size > MAX_FRAME_PAYLOAD {
        return Err(Error::frame(format!("frame payload {size} too large")));
    }
    backfill_size(&mut dst[head..], size);
    Ok(())
}

/// Append an already-compressed payload in the same envelope.
pub fn append_raw_frame(dst: &mut Vec<u8>, compressed: &[u8]) -> Result<()> {
    if compressed.len() > MAX_FRAME_PAYLOAD {
        return Err(Error::frame(format!(
            "frame payload {} too large",
            compressed.len()
        )));
    }
    dst.push(TAG_BLOB_VARLEN);
    put_uvarint_fixed4(dst, compressed.len() as u64);
    dst.extend_from_slice(compressed);
    Ok(())
}

fn backfill_size(frame: &mut [u8], size: usize) {
    let mut head = Vec::with_capacity(4);
    put_uvarint_fixed4(&mut head, size as u64);
    frame[1..FRAME_HEADER_LEN].copy_from_slice(&head);
}

/// Parse a frame header, returning the payload length.
pub fn frame_payload_len(head: &[u8; FRAME_HEADER_LEN]) -> Result<usize> {
    if head[0] != TAG_BLOB_VARLEN {
        return Err(Error::frame(format!(
            "bad frame tag {:#04x}, want {TAG_BLOB_VARLEN:#04x}",
            head[0]
        )));
    }
    if head[4] & 0x80 == 0 || head[1] & 0x80 != 0 || head[2] & 0x80 != 0 || head[3] & 0x80 != 0 {
        return Err(Error::frame("malformed frame size varuint".to_string()));
    }
    Ok(((head[1] as usize) << 21)
        | ((head[2] as usize) << 14)
        | ((head[3] as usize) << 7)
        | (head[4] & 0x7f) as usize)
}

/// Consumer of decompressed chunks. A sink that can take columnar frames
/// directly opts in through `configure_zion` and then receives the
/// compressed frames via `write_zion_frame`.
pub trait ChunkSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    fn configure_zion(&mut self, chunk_size: usize) -> bool {
        let _ = chunk_size;
        false
    }

    fn write_zion_frame(&mut self, frame: &[u8]) -> Result<()> {
        let _ = frame;
        Err(Error::frame("sink does not accept columnar frames".to_string()))
    }
}

impl<T: ChunkSink + ?Sized> ChunkSink for &mut T {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        (**self).write_chunk(chunk)
    }
    fn configure_zion(&mut self, chunk_size: usize) -> bool {
        (**self).configure_zion(chunk_size)
    }
    fn write_zion_frame(&mut self, frame: &[u8]) -> Result<()> {
        (**self).write_zion_frame(frame)
    }
}

/// Streaming decoder for the data section of a packfile.
pub struct BlockDecoder {
    algo: String,
    chunk_size: usize,
    dec: Box<dyn Decompressor>,
    alloc: Option<Box<dyn FnMut(usize) -> Vec<u8> + Send>>,
    scratch: Vec<u8>,
}

impl BlockDecoder {
    pub fn new(algo: &str, block_shift: u32) -> Result<Self> {
        Ok(BlockDecoder {
            algo: algo.to_string(),
            chunk_size: 1usize << block_shift,
            dec: super::must_decompress(algo)?,
            alloc: None,
            scratch: Vec::new(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Route per-write chunk buffers through a caller-supplied allocator,
    /// e.g. into a separately managed memory region.
    pub fn set_allocator(&mut self, alloc: impl FnMut(usize) -> Vec<u8> + Send + 'static) {
        self.alloc = Some(Box::new(alloc));
    }

    fn next_frame<'a>(
        r: &mut dyn Read,
        scratch: &'a mut Vec<u8>,
    ) -> Result<Option<&'a [u8]>> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        let mut got = 0usize;
        while got < head.len() {
            let n = r.read(&mut head[got..])?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(Error::frame("truncated frame header".to_string()));
            }
            got += n;
        }
        let len = frame_payload_len(&head)?;
        scratch.resize(len, 0);
        r.read_exact(&mut scratch[..])
            .map_err(|_| Error::frame("truncated frame payload".to_string()))?;
        Ok(Some(&scratch[..]))
    }

    /// Fully decompress a data section; `dst` must be exactly the
    /// trailer's decompressed size.
    pub fn decompress(&mut self, r: &mut dyn Read, dst: &mut [u8]) -> Result<()> {
        if dst.len() % self.chunk_size != 0 {
            return Err(Error::frame(format!(
                "destination size {} is not a multiple of the chunk size {}",
                dst.len(),
                self.chunk_size
            )));
        }
        let mut off = 0usize;
        let mut scratch = std::mem::take(&mut self.scratch);
        while off < dst.len() {
            let frame = match Self::next_frame(r, &mut scratch)? {
                Some(f) => f,
                None => {
                    self.scratch = scratch;
                    return Err(Error::frame(format!(
                        "stream ended at {off} of {} decompressed bytes",
                        dst.len()
                    )));
                }
            };
            let out = &mut dst[off..off + self.chunk_size];
            if let Err(e) = self.dec.decompress(frame, out) {
                self.scratch = scratch;
                return Err(e);
            }
            off += self.chunk_size;
        }
        self.scratch = scratch;
        if Self::next_frame(r, &mut self.scratch)?.is_some() {
            return Err(Error::frame("trailing frames past decompressed size".to_string()));
        }
        Ok(())
    }

    /// Stream-decompress, writing one chunk per `write_chunk` call. When
    /// the codec is columnar and the sink accepts raw columnar frames,
    /// the compressed frames are handed through untouched.
    pub fn copy(&mut self, w: &mut dyn ChunkSink, r: &mut dyn Read) -> Result<u64> {
        let passthrough = is_zion(&self.algo) && w.configure_zion(self.chunk_size);
        let mut written = 0u64;
        let mut scratch = std::mem::take(&mut self.scratch);
        loop {
            let frame = match Self::next_frame(r, &mut scratch) {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    self.scratch = scratch;
                    return Err(e);
                }
            };
            let res = if passthrough {
                w.write_zion_frame(frame).map(|()| self.chunk_size as u64)
            } else {
                let mut buf = match self.alloc.as_mut() {
                    Some(alloc) => alloc(self.chunk_size),
                    None => Vec::with_capacity(self.chunk_size),
                };
                buf.resize(self.chunk_size, 0);
                self.dec
                    .decompress(frame, &mut buf)
                    .and_then(|()| w.write_chunk(&buf))
                    .map(|()| self.chunk_size as u64)
            };
            match res {
                Ok(n) => written += n,
                Err(e) => {
                    self.scratch = scratch;
                    return Err(e);
                }
            }
        }
        self.scratch = scratch;
        Ok(written)
    }

    /// `copy` over an in-memory data section.
    pub fn copy_bytes(&mut self, w: &mut dyn ChunkSink, src: &[u8]) -> Result<u64> {
        let mut r = src;
        self.copy(w, &mut r)
    }
}
