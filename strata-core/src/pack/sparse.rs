//! Per-packfile sparse metadata: for each indexed field path, two
//! monotonic lists bounding the timestamps seen in each block, plus a bag
//! of values constant across the whole packfile.
//!
//! The lists are a lower envelope, not exact per-block ranges: entries
//! that would break monotonicity are removed retroactively, which only
//! ever widens the answer a lookup returns. Pruning stays conservative.

use crate::error::{Error, Result};
use crate::sdr::dec::Datum;
use crate::sdr::enc::Enc;
use crate::sdr::sym::Symtab;
use crate::sdr::OwnedDatum;

pub type FieldPath = Vec<String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    /// Microseconds since the Unix epoch.
    pub when: i64,
    /// Block index boundary this entry refers to.
    pub offset: usize,
}

/// Monotonic time bounds for one field path.
///
/// `min[i] = (t, k)` asserts every block at index >= `k` has minimum
/// timestamp >= `t`. `max[i] = (t, k)` asserts every block at index < `k`
/// (and after the previous entry) has maximum timestamp <= `t`. Both
/// lists are strictly increasing in `offset` and non-decreasing in
/// `when`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeIndex {
    min: Vec<Span>,
    max: Vec<Span>,
}

impl TimeIndex {
    pub fn blocks(&self) -> usize {
        self.max.last().map(|s| s.offset).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.max.is_empty()
    }

    /// Granularity of `start` lookups.
    pub fn start_intervals(&self) -> usize {
        self.max.len()
    }

    /// Granularity of `end` lookups.
    pub fn end_intervals(&self) -> usize {
        self.min.len()
    }

    /// Record that block `pos` spans `[start, end]`.
    pub fn push_at(&mut self, pos: usize, start: i64, end: i64) {
        debug_assert!(start <= end);
        debug_assert!(pos >= self.blocks());
        // remove min entries the new block would violate; the replacement
        // begins where the earliest removed claim began
        let mut replace_at = pos;
        while let Some(last) = self.min.last() {
            if last.when > start {
                replace_at = last.offset;
                self.min.pop();
            } else {
                break;
            }
        }
        match self.min.last() {
            Some(l) if l.when == start => {}
            _ => self.min.push(Span {
                when: start,
                offset: replace_at,
            }),
        }
        match self.max.last_mut() {
            Some(l) if end <= l.when => {
                // overlapping range: widen the existing entry
                l.offset = pos + 1;
            }
            _ => self.max.push(Span {
                when: end,
                offset: pos + 1,
            }),
        }
    }

    /// Extend coverage to `blocks` without new data (the field is absent
    /// from the blocks in between, so existing claims hold vacuously).
    pub fn extend_to(&mut self, blocks: usize) {
        if let Some(l) = self.max.last_mut() {
            if l.offset < blocks {
                l.offset = blocks;
            }
        }
    }

    /// Widen the most recent interval in place (no block added).
    pub fn update_latest(&mut self, start: i64, end: i64) {
        if self.max.is_empty() {
            return;
        }
        let pos = self.blocks();
        let mut replace_at = pos.saturating_sub(1);
        let mut removed = false;
        while let Some(last) = self.min.last() {
            if last.when > start {
                replace_at = last.offset;
                self.min.pop();
                removed = true;
            } else {
                break;
            }
        }
        if removed || self.min.is_empty() {
            match self.min.last() {
                Some(l) if l.when == start => {}
                _ => self.min.push(Span {
                    when: start,
                    offset: replace_at,
                }),
            }
        }
        if let Some(l) = self.max.last_mut() {
            if end > l.when {
                l.when = end;
            }
        }
    }

    /// Smallest block index at which a value >= `when` may appear.
    pub fn start(&self, when: i64) -> usize {
        let j = self.max.partition_point(|s| s.when < when);
        if j == 0 { 0 } else { self.max[j - 1].offset }
    }

    /// Smallest block index past which no value <= `when` may appear.
    pub fn end(&self, when: i64) -> usize {
        let j = self.min.partition_point(|s| s.when <= when);
        if j == self.min.len() {
            self.blocks()
        } else {
            self.min[j].offset
        }
    }

    pub fn contains(&self, when: i64) -> bool {
        self.start(when) < self.end(when)
    }

    /// Earliest and latest timestamps covered.
    pub fn min_max(&self) -> Option<(i64, i64)> {
        let lo = self.min.first()?.when;
        let hi = self.max.last()?.when;
        Some((lo, hi))
    }

    /// Deep copy truncated to the first `k` blocks, synthesizing the
    /// boundary entry at `k` when no entry lands there.
    pub fn trim(&self, k: usize) -> TimeIndex {
        let mut out = TimeIndex::default();
        for s in &self.min {
            if s.offset >= k {
                break;
            }
            out.min.push(*s);
        }
        for s in &self.max {
            if s.offset >= k {
                out.max.push(Span {
                    when: s.when,
                    offset: k,
                });
                break;
            }
            out.max.push(*s);
        }
        out
    }

    /// Concatenate `other` after `self`, rebasing its offsets by `base`.
    pub fn append_at(&mut self, base: usize, other: &TimeIndex) {
        if other.max.is_empty() {
            return;
        }
        // claims about "all later blocks" must survive the new tail
        if let Some(first) = other.min.first() {
            let mut replace_at = base;
            let mut removed = false;
            while let Some(last) = self.min.last() {
                if last.when > first.when {
                    replace_at = last.offset;
                    self.min.pop();
                    removed = true;
                } else {
                    break;
                }
            }
            if removed {
                self.min.push(Span {
                    when: first.when,
                    offset: replace_at,
                });
            }
        }
        for s in &other.min {
            match self.min.last() {
                Some(l) if l.when >= s.when => continue,
                _ => self.min.push(Span {
                    when: s.when,
                    offset: s.offset + base,
                }),
            }
        }
        for s in &other.max {
            let shifted = Span {
                when: s.when,
                offset: s.offset + base,
            };
            match self.max.last_mut() {
                Some(l) if shifted.when <= l.when => {
                    l.offset = shifted.offset;
                }
                _ => self.max.push(shifted),
            }
        }
    }

    fn encode_spans(e: &mut Enc, spans: &[Span]) {
        e.begin_list();
        let (mut pw, mut po) = (0i64, 0i64);
        for s in spans {
            e.int(s.when - pw);
            e.int(s.offset as i64 - po);
            pw = s.when;
            po = s.offset as i64;
        }
        e.end();
    }

    fn decode_spans(d: &Datum<'_>) -> Result<Vec<Span>> {
        let items = d.as_list()?;
        if items.len() % 2 != 0 {
            return Err(Error::corrupt("odd span list length"));
        }
        let mut out = Vec::with_capacity(items.len() / 2);
        let (mut pw, mut po) = (0i64, 0i64);
        for pair in items.chunks(2) {
            pw += pair[0].as_int()?;
            po += pair[1].as_int()?;
            if po < 0 {
                return Err(Error::corrupt("negative span offset"));
            }
            out.push(Span {
                when: pw,
                offset: po as usize,
            });
        }
        Ok(out)
    }
}

/// Sparse index over one packfile (or one indirect descriptor list).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseIndex {
    blocks: usize,
    consts: Vec<(String, OwnedDatum)>,
    fields: Vec<(FieldPath, TimeIndex)>,
}

impl SparseIndex {
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn field_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter().map(|(p, _)| p)
    }

    pub fn time_index(&self, path: &[String]) -> Option<&TimeIndex> {
        self.fields
            .binary_search_by(|(p, _)| p.as_slice().cmp(path))
            .ok()
            .map(|i| &self.fields[i].1)
    }

    pub fn min_max(&self, path: &[String]) -> Option<(i64, i64)> {
        self.time_index(path)?.min_max()
    }

    pub fn const_val(&self, name: &str) -> Option<&OwnedDatum> {
        self.consts
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|i| &self.consts[i].1)
    }

    pub fn set_const(&mut self, name: &str, v: OwnedDatum) {
        match self.consts.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(i) => self.consts[i].1 = v,
            Err(i) => self.consts.insert(i, (name.to_string(), v)),
        }
    }

    pub fn consts(&self) -> &[(String, OwnedDatum)] {
        &self.consts
    }

    fn field_entry(&mut self, path: &[String]) -> &mut TimeIndex {
        match self
            .fields
            .binary_search_by(|(p, _)| p.as_slice().cmp(path))
        {
            Ok(i) => &mut self.fields[i].1,
            Err(i) => {
                self.fields.insert(i, (path.to_vec(), TimeIndex::default()));
                &mut self.fields[i].1
            }
        }
    }

    /// Record `[min, max]` for `path` in the block currently being built.
    pub fn push(&mut self, path: &[String], min: i64, max: i64) {
        let pos = self.blocks;
        self.field_entry(path).push_at(pos, min, max);
    }

    /// Finish the current block; fields that saw no `push` get an empty
    /// interval so every field covers the same block count.
    pub fn bump(&mut self) {
        self.blocks += 1;
        let blocks = self.blocks;
        for (_, ti) in &mut self.fields {
            ti.extend_to(blocks);
        }
    }

    /// Widen the latest interval for `path` without adding a block.
    pub fn update(&mut self, path: &[String], min: i64, max: i64) {
        self.field_entry(path).update_latest(min, max);
    }

    /// Deep copy truncated to the first `k` blocks.
    pub fn trim(&self, k: usize) -> SparseIndex {
        let k = k.min(self.blocks);
        SparseIndex {
            blocks: k,
            consts: self.consts.clone(),
            fields: self
                .fields
                .iter()
                .map(|(p, ti)| (p.clone(), ti.trim(k)))
                .collect(),
        }
    }

    /// Concatenate `other` after `self`. Fails when the two indexes cover
    /// different field sets; constants that disagree are dropped.
    pub fn append(&mut self, other: &SparseIndex) -> Result<()> {
        if self.blocks == 0 && self.fields.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        let a: Vec<_> = self.fields.iter().map(|(p, _)| p.clone()).collect();
        let b: Vec<_> = other.fields.iter().map(|(p, _)| p.clone()).collect();
        if a != b {
            return Err(Error::Format(
                "cannot append sparse index with different field sets".to_string(),
            ));
        }
        let base = self.blocks;
        for ((_, dst), (_, src)) in self.fields.iter_mut().zip(other.fields.iter()) {
            dst.append_at(base, src);
        }
        self.blocks += other.blocks;
        self.consts
            .retain(|(name, v)| other.const_val(name) == Some(v));
        Ok(())
    }

    pub fn encode(&self, e: &mut Enc, st: &mut Symtab) {
        let (s_blocks, s_consts, s_indices) =
            (st.intern("blocks"), st.intern("consts"), st.intern("indices"));
        let (s_path, s_min, s_max) = (st.intern("path"), st.intern("min"), st.intern("max"));
        e.begin_struct();
        e.field(s_blocks);
        e.uint(self.blocks as u64);
        e.field(s_consts);
        e.begin_struct();
        for (name, v) in &self.consts {
            let sym = st.intern(name);
            e.field(sym);
            e.datum(v, st);
        }
        e.end();
        e.field(s_indices);
        e.begin_list();
        for (path, ti) in &self.fields {
            e.begin_struct();
            e.field(s_path);
            e.begin_list();
            for p in path {
                e.string(p);
            }
            e.end();
            e.field(s_min);
            TimeIndex::encode_spans(e, &ti.min);
            e.field(s_max);
            TimeIndex::encode_spans(e, &ti.max);
            e.end();
        }
        e.end();
        e.end();
    }

    pub fn decode(d: &Datum<'_>, st: &Symtab) -> Result<SparseIndex> {
        let mut out = SparseIndex::default();
        for (sym, val) in d.as_struct()? {
            match st.name(*sym) {
                Some("blocks") => out.blocks = val.as_int()? as usize,
                Some("consts") => {
                    for (csym, cval) in val.as_struct()? {
                        let name = st
                            .name(*csym)
                            .ok_or_else(|| Error::corrupt("const name symbol"))?;
                        out.consts.push((name.to_string(), cval.to_owned(st)?));
                    }
                    out.consts.sort_by(|a, b| a.0.cmp(&b.0));
                }
                Some("indices") => {
                    for item in val.as_list()? {
                        let mut path = FieldPath::new();
                        let mut ti = TimeIndex::default();
                        for (fsym, fval) in item.as_struct()? {
                            match st.name(*fsym) {
                                Some("path") => {
                                    for seg in fval.as_list()? {
                                        path.push(seg.as_str()?.to_string());
                                    }
                                }
                                Some("min") => ti.min = TimeIndex::decode_spans(fval)?,
                                Some("max") => ti.max = TimeIndex::decode_spans(fval)?,
                                _ => {}
                            }
                        }
                        out.fields.push((path, ti));
                    }
                    out.fields.sort_by(|a, b| a.0.cmp(&b.0));
                }
                _ => {}
            }
        }
        Ok(out)
    }
}
