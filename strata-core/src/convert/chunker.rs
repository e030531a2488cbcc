//! Packs encoded records into fixed-size chunks. Every block-leading
//! chunk carries a begin-version marker and the full symbol table so a
//! reader can decode any block independently; chunks inside a block
//! resume the running table. Top-level timestamp fields are tracked and
//! delivered to the sink at every metadata flush.

use std::mem;

use crate::error::{Error, Result};
use crate::pack::sparse::FieldPath;
use crate::pack::writer::BlockSink;
use crate::sdr::enc::Enc;
use crate::sdr::sym::Symtab;
use crate::sdr::{put_pad, OwnedDatum};

pub struct Chunker<W: BlockSink> {
    out: W,
    align: usize,
    /// Chunks per metadata flush.
    flush_every: usize,
    symtab: Symtab,
    /// Symbols already shipped in emitted chunk headers.
    frozen_syms: usize,
    /// Symbols used by admitted records; symbols interned by a record
    /// that rolled into the next chunk ship with that next chunk.
    syms_mark: usize,
    records: Vec<u8>,
    scratch: Vec<u8>,
    chunks_in_block: usize,
    ranges: Vec<(FieldPath, i64, i64)>,
    force_bvm: bool,
    chunks_written: u64,
}

impl<W: BlockSink> Chunker<W> {
    pub fn new(out: W, align: usize, flush_meta_bytes: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Chunker {
            out,
            align,
            flush_every: (flush_meta_bytes / align).max(1),
            symtab: Symtab::new(),
            frozen_syms: 0,
            syms_mark: 0,
            records: Vec::with_capacity(align),
            scratch: Vec::new(),
            chunks_in_block: 0,
            ranges: Vec::new(),
            force_bvm: true,
            chunks_written: 0,
        }
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Chunks per metadata flush.
    pub fn flush_every(&self) -> usize {
        self.flush_every
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn symtab(&self) -> &Symtab {
        &self.symtab
    }

    /// Adopt a symbol table accumulated elsewhere (spliced frames); the
    /// adopted symbols count as already shipped.
    pub fn set_symbols(&mut self, st: Symtab) {
        debug_assert!(
            self.symtab.is_empty() && self.records.is_empty(),
            "symbol adoption on a dirty chunker"
        );
        self.frozen_syms = st.len();
        self.syms_mark = st.len();
        self.symtab = st;
    }

    /// Continue a block whose leading chunks were written directly to
    /// the sink, seeding their chunk count and known time ranges.
    pub fn resume_block(&mut self, chunks: usize, ranges: Vec<(FieldPath, i64, i64)>) {
        self.chunks_in_block += chunks;
        self.force_bvm = false;
        for (path, min, max) in ranges {
            self.track_path(path, min, max);
        }
    }

    fn track_path(&mut self, path: FieldPath, min: i64, max: i64) {
        match self.ranges.iter_mut().find(|(p, _, _)| *p == path) {
            Some((_, lo, hi)) => {
                *lo = (*lo).min(min);
                *hi = (*hi).max(max);
            }
            None => self.ranges.push((path, min, max)),
        }
    }

    fn header_len(&self, upto: usize) -> usize {
        let mut probe = Vec::new();
        if self.force_bvm {
            self.symtab.encode_full_upto(&mut probe, upto);
        } else {
            self.symtab.encode_resume_upto(&mut probe, self.frozen_syms, upto);
        }
        probe.len()
    }

    fn seal_chunk(&mut self) -> Result<()> {
        let mut chunk = Vec::with_capacity(self.align);
        if self.force_bvm {
            self.symtab.encode_full_upto(&mut chunk, self.syms_mark);
        } else {
            self.symtab
                .encode_resume_upto(&mut chunk, self.frozen_syms, self.syms_mark);
        }
        chunk.extend_from_slice(&self.records);
        self.records.clear();
        assert!(chunk.len() <= self.align, "chunk overflow");
        let pad = self.align - chunk.len();
        put_pad(&mut chunk, pad);
        self.frozen_syms = self.syms_mark;
        self.force_bvm = false;
        self.out.write_chunk(&chunk)?;
        self.chunks_written += 1;
        self.chunks_in_block += 1;
        if self.chunks_in_block >= self.flush_every {
            self.flush_ranges()?;
        }
        Ok(())
    }

    fn flush_ranges(&mut self) -> Result<()> {
        for (path, min, max) in mem::take(&mut self.ranges) {
            self.out.set_min_max(&path, min, max);
        }
        self.out.flush_meta()?;
        self.chunks_in_block = 0;
        // the next chunk starts a block and must decode on its own
        self.force_bvm = true;
        Ok(())
    }

    pub fn write_record(&mut self, rec: &OwnedDatum) -> Result<()> {
        let OwnedDatum::Struct(fields) = rec else {
            return Err(Error::NoMatch("row is not a record".to_string()));
        };
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();
        let mut e = Enc::from_buf(scratch);
        e.datum(rec, &mut self.symtab);
        let encoded = e.into_inner();

        // header size is computed as if this record is admitted, so the
        // sealed chunk can never overflow the alignment
        if self.header_len(self.symtab.len()) + self.records.len() + encoded.len() > self.align {
            if !self.records.is_empty() {
                self.seal_chunk()?;
            }
            let need = self.header_len(self.symtab.len()) + encoded.len();
            if need > self.align {
                self.scratch = encoded;
                return Err(Error::TooLarge {
                    size: need,
                    max: self.align,
                });
            }
        }
        self.records.extend_from_slice(&encoded);
        self.syms_mark = self.symtab.len();
        self.scratch = encoded;

        for (name, v) in fields {
            if let OwnedDatum::Timestamp(t) = v {
                self.track_path(vec![name.clone()], *t, *t);
            }
        }
        Ok(())
    }

    /// Seal any partial chunk and flush pending metadata. The sink is
    /// left ready for more blocks (or for close).
    pub fn finish(&mut self) -> Result<()> {
        if !self.records.is_empty() {
            self.seal_chunk()?;
        }
        if self.chunks_in_block > 0 || !self.ranges.is_empty() {
            self.flush_ranges()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdr::dec::Dec;
    use crate::sdr::BVM;

    #[derive(Default)]
    struct Capture {
        chunks: Vec<Vec<u8>>,
        flushes: Vec<(usize, Vec<(FieldPath, i64, i64)>)>,
        pending: Vec<(FieldPath, i64, i64)>,
        since_flush: usize,
    }

    impl BlockSink for Capture {
        fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
            self.chunks.push(chunk.to_vec());
            self.since_flush += 1;
            Ok(())
        }
        fn set_min_max(&mut self, path: &[String], min: i64, max: i64) {
            self.pending.push((path.to_vec(), min, max));
        }
        fn flush_meta(&mut self) -> Result<()> {
            self.flushes
                .push((self.since_flush, mem::take(&mut self.pending)));
            self.since_flush = 0;
            Ok(())
        }
    }

    fn row(i: i64) -> OwnedDatum {
        OwnedDatum::Struct(vec![
            ("ts".to_string(), OwnedDatum::Timestamp(1_000 + i)),
            ("name".to_string(), OwnedDatum::String(format!("row-{i}"))),
            ("n".to_string(), OwnedDatum::Int(i)),
        ])
    }

    #[test]
    fn chunks_are_aligned_and_decodable() {
        let align = 512;
        let mut ch = Chunker::new(Capture::default(), align, align * 4);
        for i in 0..200 {
            ch.write_record(&row(i)).unwrap();
        }
        ch.finish().unwrap();
        let cap = ch.into_inner();
        assert!(cap.chunks.len() > 1);

        let mut st = Symtab::new();
        let mut rows = 0i64;
        for (i, chunk) in cap.chunks.iter().enumerate() {
            assert_eq!(chunk.len(), align);
            if i == 0 {
                assert!(chunk.starts_with(&BVM));
            }
            let mut d = Dec::new(chunk);
            st.read_block_header(&mut d).unwrap();
            loop {
                d.skip_pads();
                if d.done() {
                    break;
                }
                let rec = d.value().unwrap().to_owned(&st).unwrap();
                match rec {
                    OwnedDatum::Struct(fields) => {
                        assert_eq!(fields[0].1, OwnedDatum::Timestamp(1_000 + rows));
                    }
                    other => panic!("unexpected {other:?}"),
                }
                rows += 1;
            }
        }
        assert_eq!(rows, 200);
    }

    #[test]
    fn flush_interval_delivers_ranges() {
        let align = 512;
        // flush every 2 chunks
        let mut ch = Chunker::new(Capture::default(), align, align * 2);
        for i in 0..200 {
            ch.write_record(&row(i)).unwrap();
        }
        ch.finish().unwrap();
        let cap = ch.into_inner();
        assert!(!cap.flushes.is_empty());
        let mut last_hi = i64::MIN;
        for (chunks, ranges) in &cap.flushes {
            assert!(*chunks >= 1 && *chunks <= 2);
            let ts = ranges.iter().find(|(p, _, _)| p == &vec!["ts".to_string()]);
            let (_, lo, hi) = ts.expect("ts range flushed");
            assert!(lo <= hi);
            assert!(*lo > last_hi, "ranges must advance monotonically");
            last_hi = *hi;
        }
    }

    #[test]
    fn block_leading_chunks_restart_the_symbol_table() {
        let align = 512;
        let mut ch = Chunker::new(Capture::default(), align, align); // flush every chunk
        for i in 0..50 {
            ch.write_record(&row(i)).unwrap();
        }
        ch.finish().unwrap();
        let cap = ch.into_inner();
        for chunk in &cap.chunks {
            // every chunk leads a block here, so each must carry a BVM
            assert!(chunk.starts_with(&BVM));
            let mut st = Symtab::new();
            let mut d = Dec::new(chunk);
            st.read_block_header(&mut d).unwrap();
            assert_eq!(st.len(), 3);
        }
    }

    #[test]
    fn oversized_record_is_fatal() {
        let mut ch = Chunker::new(Capture::default(), 256, 1024);
        let rec = OwnedDatum::Struct(vec![(
            "blob".to_string(),
            OwnedDatum::String("x".repeat(400)),
        )]);
        match ch.write_record(&rec) {
            Err(e) => assert!(e.is_fatal()),
            Ok(_) => panic!("record larger than a chunk must fail"),
        }
    }
}
