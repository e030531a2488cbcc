//! Columnar transform for SDR record streams.
//!
//! A zion frame splits a chunk into a shape stream (record layouts) and 16
//! value buckets keyed by a hash of the field symbol, each section
//! compressed independently. Readers that only need a few fields decode
//! only the buckets those fields hash into.
//!
//! Container layout:
//!
//! ```text
//! "ZN1" | bucket-algo u8 | section(header) | section(shape) | 16 x section(bucket)
//! ```
//!
//! where `section = varuint(compressed_len) || compressed bytes` and the
//! header section is the chunk's BVM/symbol-table prefix verbatim.

use super::zstd::{compress_block, decompress_block};
use super::{Compressor, Decompressor};
use crate::error::{Error, Result};
use crate::sdr::dec::{value_size, Dec};
use crate::sdr::sym::Symtab;
use crate::sdr::{get_uvarint, put_pad, put_uvarint, LEN_VAR, TYPE_STRUCT};

const MAGIC: &[u8; 3] = b"ZN1";
pub const NUM_BUCKETS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BucketAlgo {
    Zstd = 0,
    IguanaV0 = 1,
    IguanaV0Specialized = 2,
}

impl BucketAlgo {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BucketAlgo::Zstd),
            1 => Some(BucketAlgo::IguanaV0),
            2 => Some(BucketAlgo::IguanaV0Specialized),
            _ => None,
        }
    }
}

#[inline]
pub fn bucket_of(sym: u32) -> usize {
    (sym.wrapping_mul(2654435761) >> 16) as usize & (NUM_BUCKETS - 1)
}

/// Split one top-level struct: returns (content, total encoded size).
fn struct_content(buf: &[u8]) -> Result<(&[u8], usize)> {
    let d = *buf
        .first()
        .ok_or_else(|| Error::corrupt("empty record"))?;
    if d >> 4 != TYPE_STRUCT {
        return Err(Error::corrupt("top-level value is not a record"));
    }
    let low = d & 0x0F;
    if low == 0x0F {
        return Ok((&[], 1));
    }
    let mut pos = 1usize;
    let len = if low == LEN_VAR {
        get_uvarint(buf, &mut pos)? as usize
    } else {
        low as usize
    };
    if buf.len() < pos + len {
        return Err(Error::corrupt("truncated record"));
    }
    Ok((&buf[pos..pos + len], pos + len))
}

fn put_section(dst: &mut Vec<u8>, raw: &[u8]) -> Result<()> {
    if raw.is_empty() {
        dst.push(0x80); // varuint(0)
        return Ok(());
    }
    let packed = compress_block(raw)?;
    put_uvarint(dst, packed.len() as u64);
    dst.extend_from_slice(&packed);
    Ok(())
}

pub struct ZionCompressor {
    algo: BucketAlgo,
    symtab: Symtab,
    shape: Vec<u8>,
    buckets: Vec<Vec<u8>>,
}

impl ZionCompressor {
    pub fn new(algo: BucketAlgo) -> Self {
        ZionCompressor {
            algo,
            symtab: Symtab::new(),
            shape: Vec::new(),
            buckets: vec![Vec::new(); NUM_BUCKETS],
        }
    }
}

impl Compressor for ZionCompressor {
    fn name(&self) -> &'static str {
        match self.algo {
            BucketAlgo::Zstd => "zion",
            BucketAlgo::IguanaV0 => "zion+iguana_v0",
            BucketAlgo::IguanaV0Specialized => "zion+iguana_v0/specialized",
        }
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        self.shape.clear();
        for b in &mut self.buckets {
            b.clear();
        }

        let mut dec = Dec::new(src);
        self.symtab.read_block_header(&mut dec)?;
        let header = &src[..dec.pos()];

        loop {
            dec.skip_pads();
            if dec.done() {
                break;
            }
            let (content, _total) = struct_content(dec.rest())?;
            let mut fields = 0u64;
            let mut syms = Vec::new();
            let mut pos = 0usize;
            while pos < content.len() {
                let sym = get_uvarint(content, &mut pos)?;
                if sym > u32::MAX as u64 {
                    return Err(Error::corrupt("field symbol overflow"));
                }
                let vlen = value_size(&content[pos..])?;
                self.buckets[bucket_of(sym as u32)]
                    .extend_from_slice(&content[pos..pos + vlen]);
                syms.push(sym);
                pos += vlen;
                fields += 1;
            }
            put_uvarint(&mut self.shape, fields);
            for s in syms {
                put_uvarint(&mut self.shape, s);
            }
            dec.skip_value()?;
        }

        dst.extend_from_slice(MAGIC);
        dst.push(self.algo as u8);
        put_section(dst, header)?;
        put_section(dst, &self.shape)?;
        for b in &self.buckets {
            put_section(dst, b)?;
        }
        Ok(())
    }
}

struct Sections<'a> {
    header: &'a [u8],
    shape: &'a [u8],
    buckets: [&'a [u8]; NUM_BUCKETS],
}

fn split_sections(src: &[u8]) -> Result<Sections<'_>> {
    if !src.starts_with(MAGIC) {
        return Err(Error::corrupt("bad columnar magic"));
    }
    let mut pos = MAGIC.len();
    let tag = *src
        .get(pos)
        .ok_or_else(|| Error::corrupt("truncated columnar frame"))?;
    BucketAlgo::from_u8(tag).ok_or_else(|| Error::corrupt("unknown bucket algo"))?;
    pos += 1;
    let mut next = |pos: &mut usize| -> Result<&[u8]> {
        let n = get_uvarint(src, pos)? as usize;
        if src.len() < *pos + n {
            return Err(Error::corrupt("truncated columnar section"));
        }
        let out = &src[*pos..*pos + n];
        *pos += n;
        Ok(out)
    };
    let header = next(&mut pos)?;
    let shape = next(&mut pos)?;
    let mut buckets = [&src[0..0]; NUM_BUCKETS];
    for b in buckets.iter_mut() {
        *b = next(&mut pos)?;
    }
    Ok(Sections {
        header,
        shape,
        buckets,
    })
}

fn inflate(section: &[u8]) -> Result<Vec<u8>> {
    if section.is_empty() {
        return Ok(Vec::new());
    }
    decompress_block(section)
}

/// Append one struct with the given (symbol, raw value) fields.
fn put_record(out: &mut Vec<u8>, fields: &[(u64, &[u8])]) {
    let content_len: usize = fields
        .iter()
        .map(|(s, v)| crate::sdr::uvarint_len(*s) + v.len())
        .sum();
    if content_len < LEN_VAR as usize {
        out.push((TYPE_STRUCT << 4) | content_len as u8);
    } else {
        out.push((TYPE_STRUCT << 4) | LEN_VAR);
        put_uvarint(out, content_len as u64);
    }
    for (s, v) in fields {
        put_uvarint(out, *s);
        out.extend_from_slice(v);
    }
}

#[derive(Default)]
pub struct ZionDecoder {
    symtab: Symtab,
}

impl ZionDecoder {
    pub fn new() -> Self {
        ZionDecoder::default()
    }

    /// Reconstruct the full record stream into `dst`, NOP-padding the
    /// tail so the output is bit-identical to the pre-compression chunk.
    pub fn decode_into(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let sec = split_sections(src)?;
        let header = inflate(sec.header)?;
        let shape = inflate(sec.shape)?;
        let mut hdec = Dec::new(&header);
        self.symtab.read_block_header(&mut hdec)?;

        let mut buckets: Vec<Vec<u8>> = Vec::with_capacity(NUM_BUCKETS);
        for b in &sec.buckets {
            buckets.push(inflate(b)?);
        }
        let mut cursors = [0usize; NUM_BUCKETS];

        let mut out = Vec::with_capacity(dst.len());
        out.extend_from_slice(&header);
        let mut spos = 0usize;
        let mut fields: Vec<(u64, &[u8])> = Vec::new();
        while spos < shape.len() {
            let nfields = get_uvarint(&shape, &mut spos)?;
            fields.clear();
            for _ in 0..nfields {
                let sym = get_uvarint(&shape, &mut spos)?;
                let b = bucket_of(sym as u32);
                let cur = cursors[b];
                let vlen = value_size(&buckets[b][cur..])?;
                cursors[b] = cur + vlen;
                fields.push((sym, &buckets[b][cur..cur + vlen]));
            }
            put_record(&mut out, &fields);
        }
        if out.len() > dst.len() {
            return Err(Error::frame(format!(
                "columnar chunk decoded to {} bytes, chunk size is {}",
                out.len(),
                dst.len()
            )));
        }
        let n = out.len();
        dst[..n].copy_from_slice(&out);
        dst[n..].fill(0x00);
        Ok(())
    }

    /// Reconstruct records containing only `fields`, skipping buckets no
    /// requested field hashes into. Output is padded to `chunk_size`.
    pub fn decode_fields(
        &mut self,
        src: &[u8],
        fields: &[String],
        chunk_size: usize,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let sec = split_sections(src)?;
        let header = inflate(sec.header)?;
        let shape = inflate(sec.shape)?;
        let mut hdec = Dec::new(&header);
        self.symtab.read_block_header(&mut hdec)?;

        let want: Vec<u32> = fields
            .iter()
            .filter_map(|f| self.symtab.lookup(f))
            .collect();
        let mut needed = [false; NUM_BUCKETS];
        for sym in &want {
            needed[bucket_of(*sym)] = true;
        }

        let mut buckets: Vec<Vec<u8>> = Vec::with_capacity(NUM_BUCKETS);
        for (i, b) in sec.buckets.iter().enumerate() {
            buckets.push(if needed[i] { inflate(b)? } else { Vec::new() });
        }
        let mut cursors = [0usize; NUM_BUCKETS];

        let start = out.len();
        out.extend_from_slice(&header);
        let mut spos = 0usize;
        let mut keep: Vec<(u64, &[u8])> = Vec::new();
        // borrow dance: collect (bucket, range) first, slice after
        let mut ranges: Vec<(u64, usize, usize, usize)> = Vec::new();
        while spos < shape.len() {
            let nfields = get_uvarint(&shape, &mut spos)?;
            ranges.clear();
            for _ in 0..nfields {
                let sym = get_uvarint(&shape, &mut spos)?;
                let b = bucket_of(sym as u32);
                if !needed[b] {
                    continue;
                }
                let cur = cursors[b];
                let vlen = value_size(&buckets[b][cur..])?;
                cursors[b] = cur + vlen;
                if want.contains(&(sym as u32)) {
                    ranges.push((sym, b, cur, vlen));
                }
            }
            keep.clear();
            for &(sym, b, cur, vlen) in &ranges {
                keep.push((sym, &buckets[b][cur..cur + vlen]));
            }
            put_record(out, &keep);
        }
        let written = out.len() - start;
        if written > chunk_size {
            return Err(Error::frame(format!(
                "projected chunk is {written} bytes, chunk size is {chunk_size}"
            )));
        }
        put_pad(out, chunk_size - written);
        Ok(())
    }
}

impl Decompressor for ZionDecoder {
    fn name(&self) -> &'static str {
        "zion"
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        self.decode_into(src, dst)
    }
}
