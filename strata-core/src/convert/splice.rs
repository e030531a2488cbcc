//! Prepend splice: replaying an existing packfile into a new one. The
//! part-level fast path (writer `write_start`) copies whole upload parts;
//! this module handles what remains. For a single-block columnar
//! packfile, nearly-full chunks are re-emitted as compressed frames
//! without recompression; everything else decodes back into records and
//! rides the normal chunker path.

use std::io::Read;

use tracing::debug;

use super::chunker::Chunker;
use crate::codec::frame::{frame_payload_len, FRAME_HEADER_LEN};
use crate::codec::zion::ZionDecoder;
use crate::codec::{is_zion, must_decompress};
use crate::error::{Error, Result};
use crate::pack::multi::StreamWriter;
use crate::pack::sparse::FieldPath;
use crate::pack::trailer::Trailer;
use crate::pack::writer::{BlockSink, CompressionWriter};
use crate::sdr::dec::Dec;
use crate::sdr::sym::Symtab;
use crate::sdr::OwnedDatum;

/// A block sink that can also accept already-compressed frame payloads.
pub trait RawChunkSink: BlockSink {
    fn write_compressed(&mut self, frame: &[u8]) -> Result<()>;
}

impl RawChunkSink for CompressionWriter {
    fn write_compressed(&mut self, frame: &[u8]) -> Result<()> {
        CompressionWriter::write_compressed(self, frame)
    }
}

impl RawChunkSink for StreamWriter {
    fn write_compressed(&mut self, frame: &[u8]) -> Result<()> {
        StreamWriter::write_compressed(self, frame)
    }
}

impl<T: RawChunkSink + ?Sized> RawChunkSink for &mut T {
    fn write_compressed(&mut self, frame: &[u8]) -> Result<()> {
        (**self).write_compressed(frame)
    }
}

/// Chunks at or above this fill ratio are spliced without recompression.
const SPLICE_MIN_FILL: f64 = 0.9;

fn read_frame(src: &mut dyn Read, scratch: &mut Vec<u8>) -> Result<Option<usize>> {
    let mut head = [0u8; FRAME_HEADER_LEN];
    let mut got = 0usize;
    while got < head.len() {
        let n = src.read(&mut head[got..])?;
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
    src.read_exact(&mut scratch[..])
        .map_err(|_| Error::frame("truncated frame payload".to_string()))?;
    Ok(Some(len))
}

fn content_len(chunk: &[u8]) -> usize {
    let mut n = chunk.len();
    while n > 0 && chunk[n - 1] == 0x00 {
        n -= 1;
    }
    n
}

/// Replay the data section of `old` (already advanced past `skip` bytes
/// consumed by the part-level fast path) into `chunker`.
pub fn splice_packfile<W: RawChunkSink>(
    src: &mut dyn Read,
    old: &Trailer,
    skip: u64,
    out_algo: &str,
    chunker: &mut Chunker<W>,
) -> Result<()> {
    if skip as i64 >= old.offset {
        return Ok(());
    }
    let align = old.chunk_size();
    if align != chunker.align() {
        return Err(Error::Format(format!(
            "prepend chunk size {align} does not match writer alignment {}",
            chunker.align()
        )));
    }

    // block-level fast path: single-block columnar prefix with multiple
    // chunks, whose whole span fits inside one range-flush interval
    let fast = skip == 0
        && is_zion(&old.algo)
        && old.algo == out_algo
        && old.blocks.len() == 1
        && old.blocks[0].chunks > 1
        && chunker.flush_every() >= old.blocks[0].chunks;

    let mut st = Symtab::new();
    let mut scratch = Vec::new();
    let mut decoded = vec![0u8; align];
    let mut spliced = 0usize;
    let mut splicing = fast;

    if is_zion(&old.algo) {
        let mut dec = ZionDecoder::new();
        // symbols actually shipped by raw-spliced frames; the current
        // chunk's header is not part of the output when it re-encodes
        let mut shipped = st.clone();
        while read_frame(src, &mut scratch)?.is_some() {
            dec.decode_into(&scratch, &mut decoded)?;
            let mut d = Dec::new(&decoded);
            if splicing && spliced > 0 && d.at_bvm() {
                // a second begin-version marker means a multi-table
                // prefix; only single-table prefixes splice raw
                splicing = false;
                flip_to_records(chunker, &shipped, old, &mut spliced)?;
            }
            st.read_block_header(&mut d)?;
            if splicing && content_len(&decoded) as f64 >= SPLICE_MIN_FILL * align as f64 {
                chunker.get_mut().write_compressed(&scratch)?;
                spliced += 1;
                shipped = st.clone();
                continue;
            }
            if splicing {
                splicing = false;
                flip_to_records(chunker, &shipped, old, &mut spliced)?;
            }
            emit_records(chunker, &st, &mut d)?;
        }
        if splicing && spliced > 0 {
            // every chunk spliced raw; seed the chunker state so the
            // remainder of the block continues seamlessly
            flip_to_records(chunker, &shipped, old, &mut spliced)?;
        }
    } else {
        let mut dec = must_decompress(&old.algo)?;
        while read_frame(src, &mut scratch)?.is_some() {
            dec.decompress(&scratch, &mut decoded)?;
            let mut d = Dec::new(&decoded);
            st.read_block_header(&mut d)?;
            emit_records(chunker, &st, &mut d)?;
        }
    }
    Ok(())
}

/// Switch from raw-frame splicing to record replay: adopt the symbol
/// table the raw frames established and seed the chunker's block state
/// from the old trailer's sparse index.
fn flip_to_records<W: RawChunkSink>(
    chunker: &mut Chunker<W>,
    st: &Symtab,
    old: &Trailer,
    spliced: &mut usize,
) -> Result<()> {
    if *spliced == 0 {
        return Ok(());
    }
    debug!(chunks = *spliced, "spliced columnar frames without recompression");
    let mut ranges: Vec<(FieldPath, i64, i64)> = Vec::new();
    for path in old.sparse.field_paths() {
        if let Some((lo, hi)) = old.sparse.min_max(path) {
            ranges.push((path.clone(), lo, hi));
        }
    }
    chunker.set_symbols(st.clone());
    chunker.resume_block(*spliced, ranges);
    *spliced = 0;
    Ok(())
}

fn emit_records<W: RawChunkSink>(
    chunker: &mut Chunker<W>,
    st: &Symtab,
    d: &mut Dec<'_>,
) -> Result<()> {
    loop {
        d.skip_pads();
        if d.done() {
            return Ok(());
        }
        let rec = d.value()?.to_owned(st)?;
        match rec {
            OwnedDatum::Struct(_) => chunker.write_record(&rec)?,
            _ => {
                return Err(Error::Corrupt(
                    "packfile chunk holds a non-record value".to_string(),
                ));
            }
        }
    }
}
