//! The cold half of an index: descriptor lists packed into compressed
//! objects, reached through an ordered ref list with its own sparse
//! index. Each ref is one logical block of the sparse index, so a time
//! filter prunes whole descriptor-list files before they are fetched.

use std::io::Read;

use tracing::debug;
use uuid::Uuid;

use super::object::{Descriptor, ObjectInfo};
use crate::codec::zstd::{compress_block, decompress_block};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::pack::sparse::SparseIndex;
use crate::sdr::dec::{Datum, Dec};
use crate::sdr::enc::Enc;
use crate::sdr::sym::Symtab;
use crate::store::{InputFs, UploadFs};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndirectRef {
    pub info: ObjectInfo,
    /// Descriptors stored in the referenced file.
    pub objects: usize,
    /// Pre-compaction objects folded into this ref.
    pub orig_objects: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndirectTree {
    pub refs: Vec<IndirectRef>,
    pub sparse: SparseIndex,
}

/// Union of the time ranges and paths across a descriptor batch.
fn summary(lst: &[Descriptor]) -> Vec<(Vec<String>, i64, i64)> {
    let mut out: Vec<(Vec<String>, i64, i64)> = Vec::new();
    for d in lst {
        for path in d.trailer.sparse.field_paths() {
            if let Some((lo, hi)) = d.trailer.sparse.min_max(path) {
                match out.iter_mut().find(|(p, _, _)| p == path) {
                    Some((_, l, h)) => {
                        *l = (*l).min(lo);
                        *h = (*h).max(hi);
                    }
                    None => out.push((path.clone(), lo, hi)),
                }
            }
        }
    }
    out
}

fn encode_ref_file(descs: &[Descriptor]) -> Result<Vec<u8>> {
    let mut st = Symtab::new();
    let mut e = Enc::new();
    let s_contents = st.intern("contents");
    e.begin_struct();
    e.field(s_contents);
    e.begin_list();
    for d in descs {
        d.encode_struct(&mut e, &mut st);
    }
    e.end();
    e.end();
    let mut raw = Vec::new();
    st.encode_full(&mut raw);
    raw.extend_from_slice(e.bytes());
    compress_block(&raw)
}

fn decode_ref_file(packed: &[u8]) -> Result<Vec<Descriptor>> {
    let raw = decompress_block(packed)?;
    let mut st = Symtab::new();
    let mut d = Dec::new(&raw);
    st.read_block_header(&mut d)?;
    let body = d.value()?;
    for (sym, val) in body.as_struct()? {
        if st.name(*sym) == Some("contents") {
            let mut out = Vec::new();
            for item in val.as_list()? {
                out.push(Descriptor::decode_struct(item, &st)?);
            }
            return Ok(out);
        }
    }
    Err(Error::corrupt("descriptor list has no contents"))
}

impl IndirectTree {
    pub fn objects(&self) -> usize {
        self.refs.iter().map(|r| r.objects).sum()
    }

    /// Append a compacted descriptor batch. A small newest ref absorbs
    /// the batch in place (same logical block); otherwise the batch
    /// becomes a new ref. The replaced ref file is handed to
    /// `quarantine`.
    pub fn append(
        &mut self,
        fs: &dyn UploadFs,
        basedir: &str,
        lst: Vec<Descriptor>,
        orig_objects: usize,
        target_ref_size: i64,
        quarantine: &mut dyn FnMut(String),
    ) -> Result<()> {
        if lst.is_empty() {
            return Ok(());
        }
        let sum = summary(&lst);
        let absorb = self
            .refs
            .last()
            .is_some_and(|r| r.info.size < target_ref_size);

        let (mut descs, old_path, prev_orig) = if absorb {
            let last = self.refs.last().expect("non-empty");
            let mut r = fs.open(&last.info.path)?;
            let mut packed = Vec::new();
            r.read_to_end(&mut packed)?;
            let descs = decode_ref_file(&packed)?;
            // same logical block: widen its ranges in place
            for (path, lo, hi) in &sum {
                self.sparse.update(path, *lo, *hi);
            }
            (descs, Some(last.info.path.clone()), last.orig_objects)
        } else {
            for (path, lo, hi) in &sum {
                self.sparse.push(path, *lo, *hi);
            }
            self.sparse.bump();
            (Vec::new(), None, 0)
        };
        descs.extend(lst);

        let name = format!("{basedir}/indirect-{}", Uuid::new_v4());
        let packed = encode_ref_file(&descs)?;
        let etag = fs.write_file(&name, &packed)?;
        // the store must hand back exactly what we wrote
        let info = fs.stat(&name)?;
        let observed = fs.etag(&name, &info)?;
        if observed != etag {
            return Err(Error::EtagChanged {
                path: name,
                want: etag,
                got: observed,
            });
        }
        debug!(path = %name, objects = descs.len(), "wrote indirect descriptor list");

        let new_ref = IndirectRef {
            info: ObjectInfo {
                path: name,
                etag,
                last_modified: info.last_modified,
                format: String::new(),
                size: info.size,
            },
            objects: descs.len(),
            orig_objects: prev_orig + orig_objects,
        };
        if absorb {
            *self.refs.last_mut().expect("non-empty") = new_ref;
        } else {
            self.refs.push(new_ref);
        }
        if let Some(p) = old_path {
            quarantine(p);
        }
        Ok(())
    }

    /// Fetch the descriptors that may satisfy `filter`, pruning whole
    /// refs through the summary sparse index first.
    pub fn search(&self, fs: &dyn InputFs, filter: &Filter) -> Result<Vec<Descriptor>> {
        let mut pick: Vec<usize> = Vec::new();
        if filter.trivial() || filter.matches_all(&self.sparse) {
            pick.extend(0..self.refs.len());
        } else {
            filter.visit(&self.sparse, |start, end| {
                pick.extend(start..end.min(self.refs.len()));
            });
        }
        let mut out = Vec::new();
        for i in pick {
            let r = &self.refs[i];
            let mut f = fs.open(&r.info.path)?;
            let mut packed = Vec::new();
            f.read_to_end(&mut packed)?;
            for d in decode_ref_file(&packed)? {
                if filter.matches_any(&d.trailer.sparse) {
                    out.push(d);
                }
            }
        }
        Ok(out)
    }

    pub fn encode(&self, e: &mut Enc, st: &mut Symtab) {
        let (s_refs, s_sparse) = (st.intern("refs"), st.intern("sparse"));
        let (s_path, s_etag, s_lm, s_size, s_objects, s_orig) = (
            st.intern("path"),
            st.intern("etag"),
            st.intern("last-modified"),
            st.intern("size"),
            st.intern("objects"),
            st.intern("orig-objects"),
        );
        e.begin_struct();
        e.field(s_refs);
        e.begin_list();
        for r in &self.refs {
            e.begin_struct();
            e.field(s_path);
            e.string(&r.info.path);
            e.field(s_etag);
            e.string(&r.info.etag);
            e.field(s_lm);
            e.timestamp(r.info.last_modified);
            e.field(s_size);
            e.int(r.info.size);
            e.field(s_objects);
            e.uint(r.objects as u64);
            e.field(s_orig);
            e.uint(r.orig_objects as u64);
            e.end();
        }
        e.end();
        e.field(s_sparse);
        self.sparse.encode(e, st);
        e.end();
    }

    pub fn decode(d: &Datum<'_>, st: &Symtab) -> Result<IndirectTree> {
        let mut out = IndirectTree::default();
        for (sym, val) in d.as_struct()? {
            match st.name(*sym) {
                Some("refs") => {
                    for item in val.as_list()? {
                        let mut r = IndirectRef::default();
                        for (fsym, fval) in item.as_struct()? {
                            match st.name(*fsym) {
                                Some("path") => r.info.path = fval.as_str()?.to_string(),
                                Some("etag") => r.info.etag = fval.as_str()?.to_string(),
                                Some("last-modified") => {
                                    r.info.last_modified = fval.as_timestamp()?
                                }
                                Some("size") => r.info.size = fval.as_int()?,
                                Some("objects") => r.objects = fval.as_int()? as usize,
                                Some("orig-objects") => {
                                    r.orig_objects = fval.as_int()? as usize
                                }
                                _ => {}
                            }
                        }
                        out.refs.push(r);
                    }
                }
                Some("sparse") => out.sparse = SparseIndex::decode(val, st)?,
                _ => {}
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{CmpOp, Expr};
    use crate::pack::trailer::{BlockDesc, Trailer};
    use crate::sdr::OwnedDatum;
    use crate::store_fs::DirFs;

    fn desc(path: &str, lo: i64, hi: i64) -> Descriptor {
        let mut t = Trailer::new("zstd", 10);
        t.blocks.push(BlockDesc {
            offset: 0,
            chunks: 2,
        });
        t.offset = 1000;
        t.sparse.push(&[String::from("ts")], lo, hi);
        t.sparse.bump();
        Descriptor {
            info: ObjectInfo {
                path: path.to_string(),
                etag: "e".to_string(),
                last_modified: 0,
                format: crate::index::object::FORMAT_COMPRESSED_V2.to_string(),
                size: 1004,
            },
            trailer: t,
        }
    }

    #[test]
    fn append_batches_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let mut it = IndirectTree::default();
        let mut dead = Vec::new();

        // force one ref per batch with a zero absorb threshold
        for round in 0..3i64 {
            let batch: Vec<Descriptor> = (0..4)
                .map(|i| {
                    desc(
                        &format!("db/p{round}-{i}"),
                        round * 1_000,
                        round * 1_000 + 999,
                    )
                })
                .collect();
            it.append(&fs, "db", batch, 4, 0, &mut |p| dead.push(p))
                .unwrap();
        }
        assert_eq!(it.refs.len(), 3);
        assert_eq!(it.objects(), 12);
        assert_eq!(it.sparse.blocks(), 3);
        assert!(dead.is_empty());

        // time filter prunes refs: only generation 1 matches
        let f = Filter::new(Some(Expr::cmp(
            CmpOp::Eq,
            &["ts"],
            OwnedDatum::Timestamp(1_500),
        )));
        let hits = it.search(&fs, &f).unwrap();
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|d| d.info.path.starts_with("db/p1-")));

        // trivial filter sees everything
        let all = it.search(&fs, &Filter::all()).unwrap();
        assert_eq!(all.len(), 12);
    }

    #[test]
    fn small_ref_absorbs_appends() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let mut it = IndirectTree::default();
        let mut dead = Vec::new();
        it.append(
            &fs,
            "db",
            vec![desc("db/a", 0, 99)],
            1,
            256 << 10,
            &mut |p| dead.push(p),
        )
        .unwrap();
        assert_eq!(it.refs.len(), 1);
        assert_eq!(it.sparse.blocks(), 1);

        it.append(
            &fs,
            "db",
            vec![desc("db/b", 100, 199)],
            1,
            256 << 10,
            &mut |p| dead.push(p),
        )
        .unwrap();
        // absorbed: still one ref and one logical block, ranges widened
        assert_eq!(it.refs.len(), 1);
        assert_eq!(it.refs[0].objects, 2);
        assert_eq!(it.refs[0].orig_objects, 2);
        assert_eq!(it.sparse.blocks(), 1);
        assert_eq!(dead.len(), 1, "replaced ref file is quarantined");
        assert_eq!(
            it.sparse.min_max(&[String::from("ts")]),
            Some((0, 199))
        );
    }

    #[test]
    fn encode_decode_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let mut it = IndirectTree::default();
        it.append(&fs, "db", vec![desc("db/a", 0, 9)], 1, 0, &mut |_| {})
            .unwrap();
        let mut st = Symtab::new();
        let mut e = Enc::new();
        it.encode(&mut e, &mut st);
        let mut d = Dec::new(e.bytes());
        let got = IndirectTree::decode(&d.value().unwrap(), &st).unwrap();
        assert_eq!(got, it);
    }
}
