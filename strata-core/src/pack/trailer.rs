//! Self-describing packfile footer. The trailer is encoded as one SDR
//! struct prefixed by its own symbol table and followed by a little-endian
//! u32 holding the total trailer length, so a reader that knows only the
//! object size can locate it from the tail of the file.

use std::io::{Read, Seek, SeekFrom};

use super::sparse::SparseIndex;
use crate::error::{Error, Result};
use crate::sdr::dec::{Datum, Dec};
use crate::sdr::enc::Enc;
use crate::sdr::sym::Symtab;

pub const TRAILER_VERSION: i64 = 1;

/// Initial guess for the adaptive tail read.
pub const TAIL_GUESS: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockDesc {
    /// Byte offset of the block's first frame in the compressed stream.
    pub offset: i64,
    /// Number of chunks in the block.
    pub chunks: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trailer {
    pub version: i64,
    /// Absolute byte offset at which the trailer begins (end of data).
    pub offset: i64,
    /// Codec name, possibly with a `+subvariant`.
    pub algo: String,
    /// log2 of the chunk size.
    pub block_shift: u32,
    pub sparse: SparseIndex,
    pub blocks: Vec<BlockDesc>,
}

impl Trailer {
    pub fn new(algo: &str, block_shift: u32) -> Self {
        Trailer {
            version: TRAILER_VERSION,
            offset: 0,
            algo: algo.to_string(),
            block_shift,
            sparse: SparseIndex::default(),
            blocks: Vec::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        1usize << self.block_shift
    }

    pub fn decompressed_size(&self) -> i64 {
        let chunks: usize = self.blocks.iter().map(|b| b.chunks).sum();
        (chunks << self.block_shift) as i64
    }

    /// Compressed length of block `i`.
    pub fn block_len(&self, i: usize) -> i64 {
        let end = if i + 1 < self.blocks.len() {
            self.blocks[i + 1].offset
        } else {
            self.offset
        };
        end - self.blocks[i].offset
    }

    /// Append the encoded trailer and its 4-byte length suffix.
    pub fn encode_onto(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let mut st = Symtab::new();
        let mut body = Enc::new();
        self.encode_struct(&mut body, &mut st);
        st.encode_full(out);
        out.extend_from_slice(body.bytes());
        let total = (out.len() - start) as u32;
        out.extend_from_slice(&total.to_le_bytes());
    }

    /// Encode the trailer struct using the caller's symbol table; used
    /// both for the packfile footer and for embedded descriptors.
    pub fn encode_struct(&self, e: &mut Enc, st: &mut Symtab) {
        let s_version = st.intern("version");
        let s_offset = st.intern("offset");
        let s_algo = st.intern("algo");
        let s_blockshift = st.intern("blockshift");
        let s_sparse = st.intern("sparse");
        let s_blocks = st.intern("blocks-delta");
        e.begin_struct();
        e.field(s_version);
        e.int(self.version);
        e.field(s_offset);
        e.int(self.offset);
        e.field(s_algo);
        e.string(&self.algo);
        e.field(s_blockshift);
        e.uint(self.block_shift as u64);
        e.field(s_sparse);
        self.sparse.encode(e, st);
        e.field(s_blocks);
        e.begin_list();
        // double-delta offsets, delta chunk counts
        let (mut po, mut pd, mut pc) = (0i64, 0i64, 0i64);
        for b in &self.blocks {
            let d = b.offset - po;
            e.int(d - pd);
            e.int(b.chunks as i64 - pc);
            pd = d;
            po = b.offset;
            pc = b.chunks as i64;
        }
        e.end();
        e.end();
    }

    pub fn decode_struct(d: &Datum<'_>, st: &Symtab) -> Result<Trailer> {
        let mut t = Trailer::default();
        t.version = TRAILER_VERSION;
        for (sym, val) in d.as_struct()? {
            match st.name(*sym) {
                Some("version") => t.version = val.as_int()?,
                Some("offset") => t.offset = val.as_int()?,
                Some("algo") => t.algo = val.as_str()?.to_string(),
                Some("blockshift") => t.block_shift = val.as_int()? as u32,
                Some("sparse") => t.sparse = SparseIndex::decode(val, st)?,
                Some("blocks-delta") => {
                    let items = val.as_list()?;
                    if items.len() % 2 != 0 {
                        return Err(Error::corrupt("odd blocks-delta length"));
                    }
                    let (mut po, mut pd, mut pc) = (0i64, 0i64, 0i64);
                    for pair in items.chunks(2) {
                        pd += pair[0].as_int()?;
                        po += pd;
                        pc += pair[1].as_int()?;
                        if po < 0 || pc < 0 {
                            return Err(Error::corrupt("negative block geometry"));
                        }
                        t.blocks.push(BlockDesc {
                            offset: po,
                            chunks: pc as usize,
                        });
                    }
                }
                _ => {}
            }
        }
        if t.version != TRAILER_VERSION {
            return Err(Error::Obsolete(t.version));
        }
        Ok(t)
    }

    /// Decode a trailer from its encoded bytes (symbol table + body,
    /// without the 4-byte length suffix).
    pub fn decode(buf: &[u8]) -> Result<Trailer> {
        let mut st = Symtab::new();
        let mut d = Dec::new(buf);
        st.read_block_header(&mut d)?;
        let body = d.value()?;
        Self::decode_struct(&body, &st)
    }

    /// Read the trailer from the tail of an object of known size.
    /// Reads up to 1 MiB, re-reading when the declared length exceeds the
    /// first guess.
    pub fn read_from(src: &mut (impl Read + Seek), size: i64) -> Result<Trailer> {
        if size < 4 {
            return Err(Error::corrupt("object too small for a trailer"));
        }
        let guess = TAIL_GUESS.min(size as usize);
        let mut tail = vec![0u8; guess];
        src.seek(SeekFrom::Start((size as usize - guess) as u64))?;
        src.read_exact(&mut tail)?;
        let total =
            u32::from_le_bytes(tail[guess - 4..].try_into().unwrap()) as usize;
        if total + 4 > size as usize {
            return Err(Error::corrupt(format!(
                "trailer length {total} exceeds object size {size}"
            )));
        }
        if total + 4 > guess {
            tail = vec![0u8; total + 4];
            src.seek(SeekFrom::Start(size as u64 - (total as u64 + 4)))?;
            src.read_exact(&mut tail)?;
        }
        let start = tail.len() - 4 - total;
        Trailer::decode(&tail[start..tail.len() - 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(blocks: usize, stride: i64, chunks: usize) -> Trailer {
        let mut t = Trailer::new("zstd", 12);
        for i in 0..blocks {
            t.blocks.push(BlockDesc {
                offset: i as i64 * stride,
                chunks,
            });
            t.sparse
                .push(&[String::from("ts")], i as i64 * 1000, i as i64 * 1000 + 999);
            t.sparse.bump();
        }
        t.offset = blocks as i64 * stride;
        t
    }

    #[test]
    fn roundtrip_empty() {
        let t = Trailer::new("zstd-nocrc", 20);
        let mut buf = Vec::new();
        t.encode_onto(&mut buf);
        let total = u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap()) as usize;
        assert_eq!(total + 4, buf.len());
        let got = Trailer::decode(&buf[..buf.len() - 4]).unwrap();
        assert_eq!(got, t);
        assert_eq!(got.decompressed_size(), 0);
    }

    #[test]
    fn roundtrip_large() {
        let t = sample(120_000, 32_768, 4);
        let mut buf = Vec::new();
        t.encode_onto(&mut buf);
        let got = Trailer::decode(&buf[..buf.len() - 4]).unwrap();
        assert_eq!(got, t);
        assert_eq!(
            got.decompressed_size(),
            (120_000usize * 4 << 12) as i64
        );
    }

    #[test]
    fn arithmetic_blocks_encode_small() {
        // arithmetic offsets and constant chunk counts double-delta to
        // zero after the first two entries
        let n = 10_000;
        let t = sample(n, 65_536, 8);
        let mut st = Symtab::new();
        let mut body = Enc::new();
        t.encode_struct(&mut body, &mut st);
        // measure only the blocks-delta list: encode a trailer without
        // blocks and diff the sizes
        let mut bare = t.clone();
        bare.blocks.clear();
        let mut st2 = Symtab::new();
        let mut body2 = Enc::new();
        bare.encode_struct(&mut body2, &mut st2);
        let delta_bytes = body.len() - body2.len();
        assert!(
            delta_bytes <= 3 * n,
            "blocks-delta used {delta_bytes} bytes for {n} blocks"
        );
    }

    #[test]
    fn tail_read_adaptive() {
        let t = sample(64, 4096, 2);
        let mut obj = vec![0xAB; t.offset as usize];
        t.encode_onto(&mut obj);
        let size = obj.len() as i64;
        let mut cur = std::io::Cursor::new(obj);
        let got = Trailer::read_from(&mut cur, size).unwrap();
        assert_eq!(got, t);
    }

    #[test]
    fn tail_read_larger_than_guess() {
        use crate::sdr::OwnedDatum;
        // a trailer larger than the initial guess triggers the re-read
        let mut t = sample(3, 128, 1);
        for i in 0..2200 {
            t.sparse
                .set_const(&format!("c{i}"), OwnedDatum::String("x".repeat(600)));
        }
        let mut obj = vec![0u8; t.offset as usize];
        t.encode_onto(&mut obj);
        assert!(obj.len() > TAIL_GUESS);
        let size = obj.len() as i64;
        let mut cur = std::io::Cursor::new(obj);
        let got = Trailer::read_from(&mut cur, size).unwrap();
        assert_eq!(got.blocks.len(), 3);
        assert_eq!(got, t);
    }

    #[test]
    fn block_len_uses_next_offset() {
        let t = sample(3, 100, 1);
        assert_eq!(t.block_len(0), 100);
        assert_eq!(t.block_len(2), 100);
    }
}
