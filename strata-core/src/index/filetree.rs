//! Journaled B+-tree of ingested inputs, keyed by object path. Leaves
//! hold `(path, etag, descriptor id)` and live as zstd-compressed SDR
//! objects in the backing store; inner nodes reference children by
//! `(object path, etag, last key)`. The root's children plus a journal of
//! recent inserts are embedded in the index object, so commits are cheap
//! and the journal replays lazily into the tree on first use.

use std::collections::BTreeMap;
use std::io::Read;

use rayon::prelude::*;
use tracing::debug;

use crate::codec::zstd::{compress_block, decompress_block};
use crate::error::{Error, Result};
use crate::sdr::dec::{Datum, Dec};
use crate::sdr::enc::Enc;
use crate::sdr::sym::Symtab;
use crate::store::InputFs;

/// Children per node before a split.
pub const DEFAULT_SPLIT_LEVEL: usize = 5000;
/// Journal length that triggers a sync.
pub const SYNC_JOURNAL_LEN: usize = 50;
/// Resident decoded leaf bytes that trigger a sync.
pub const SYNC_RESIDENT_BYTES: usize = 10 << 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    pub path: String,
    pub etag: String,
    /// Descriptor index; negative ids record a failed ingest.
    pub id: i64,
}

#[derive(Clone, Debug, Default)]
struct Level {
    /// Backing object name; empty for nodes never synced.
    path: String,
    etag: String,
    /// Largest key in this subtree.
    last: String,
    inner: bool,
    dirty: bool,
    loaded: bool,
    contents: Vec<LeafEntry>,
    levels: Vec<Level>,
}

impl Level {
    fn new_leaf() -> Level {
        Level {
            inner: false,
            dirty: true,
            loaded: true,
            ..Level::default()
        }
    }

    fn resident_bytes(&self) -> usize {
        if !self.loaded {
            return 0;
        }
        if self.inner {
            self.levels.iter().map(Level::resident_bytes).sum()
        } else {
            self.contents
                .iter()
                .map(|e| e.path.len() + e.etag.len() + 16)
                .sum()
        }
    }

    fn load(&mut self, fs: &dyn InputFs) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let info = fs.stat(&self.path)?;
        let got = fs.etag(&self.path, &info)?;
        if got != self.etag {
            return Err(Error::EtagChanged {
                path: self.path.clone(),
                want: self.etag.clone(),
                got,
            });
        }
        let mut r = fs.open(&self.path)?;
        let mut packed = Vec::new();
        r.read_to_end(&mut packed)?;
        let raw = decompress_block(&packed)?;
        self.decode_node(&raw)?;
        self.loaded = true;
        Ok(())
    }

    fn encode_node(&self) -> Vec<u8> {
        let mut st = Symtab::new();
        let mut e = Enc::new();
        let (s_leaf, s_inner) = (st.intern("contents"), st.intern("levels"));
        let (s_path, s_etag, s_id, s_last) = (
            st.intern("path"),
            st.intern("etag"),
            st.intern("id"),
            st.intern("last"),
        );
        e.begin_struct();
        if self.inner {
            e.field(s_inner);
            e.begin_list();
            for child in &self.levels {
                e.begin_struct();
                e.field(s_path);
                e.string(&child.path);
                e.field(s_etag);
                e.string(&child.etag);
                e.field(s_last);
                e.string(&child.last);
                e.end();
            }
            e.end();
        } else {
            e.field(s_leaf);
            e.begin_list();
            for ent in &self.contents {
                e.begin_struct();
                e.field(s_path);
                e.string(&ent.path);
                e.field(s_etag);
                e.string(&ent.etag);
                e.field(s_id);
                e.int(ent.id);
                e.end();
            }
            e.end();
        }
        e.end();
        let mut out = Vec::new();
        st.encode_full(&mut out);
        out.extend_from_slice(e.bytes());
        out
    }

    fn decode_node(&mut self, raw: &[u8]) -> Result<()> {
        let mut st = Symtab::new();
        let mut d = Dec::new(raw);
        st.read_block_header(&mut d)?;
        let body = d.value()?;
        for (sym, val) in body.as_struct()? {
            match st.name(*sym) {
                Some("contents") => {
                    self.inner = false;
                    self.contents = decode_leaf_entries(val, &st)?;
                }
                Some("levels") => {
                    self.inner = true;
                    self.levels = decode_child_list(val, &st)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Split off the upper half into a fresh sibling. The new node owns
    /// compact copies so later appends to either half cannot alias.
    fn split_half(&mut self) -> Level {
        let mut sib = Level {
            inner: self.inner,
            dirty: true,
            loaded: true,
            ..Level::default()
        };
        if self.inner {
            let mid = self.levels.len() / 2;
            sib.levels = self.levels.drain(mid..).collect();
            sib.last = sib.levels.last().map(|l| l.last.clone()).unwrap_or_default();
            self.last = self.levels.last().map(|l| l.last.clone()).unwrap_or_default();
        } else {
            let mid = self.contents.len() / 2;
            sib.contents = self.contents.drain(mid..).collect();
            sib.last = sib.contents.last().map(|e| e.path.clone()).unwrap_or_default();
            self.last = self.contents.last().map(|e| e.path.clone()).unwrap_or_default();
        }
        // old backing object no longer describes this node
        self.dirty = true;
        sib
    }

    fn width(&self) -> usize {
        if self.inner {
            self.levels.len()
        } else {
            self.contents.len()
        }
    }
}

fn decode_leaf_entries(val: &Datum<'_>, st: &Symtab) -> Result<Vec<LeafEntry>> {
    let mut out = Vec::new();
    for item in val.as_list()? {
        let mut ent = LeafEntry {
            path: String::new(),
            etag: String::new(),
            id: -1,
        };
        for (fsym, fval) in item.as_struct()? {
            match st.name(*fsym) {
                Some("path") => ent.path = fval.as_str()?.to_string(),
                Some("etag") => ent.etag = fval.as_str()?.to_string(),
                Some("id") => ent.id = fval.as_int()?,
                _ => {}
            }
        }
        out.push(ent);
    }
    Ok(out)
}

fn decode_child_list(val: &Datum<'_>, st: &Symtab) -> Result<Vec<Level>> {
    let mut out = Vec::new();
    for item in val.as_list()? {
        let mut lvl = Level::default();
        for (fsym, fval) in item.as_struct()? {
            match st.name(*fsym) {
                Some("path") => lvl.path = fval.as_str()?.to_string(),
                Some("etag") => lvl.etag = fval.as_str()?.to_string(),
                Some("last") => lvl.last = fval.as_str()?.to_string(),
                _ => {}
            }
        }
        out.push(lvl);
    }
    Ok(out)
}

enum InsertOutcome {
    Changed,
    Unchanged,
}

/// Snapshot of one root child reference, captured at sync or decode.
type ChildRef = (String, String, String); // path, etag, last

#[derive(Debug)]
pub struct FileTree {
    root: Level,
    /// Root-children references captured at the last sync or decode; the
    /// embedded encoding is always `oldroot` + journal, since the journal
    /// holds every change made after the snapshot.
    oldroot: Vec<ChildRef>,
    journal: BTreeMap<String, (String, i64)>,
    replayed: bool,
    split_level: usize,
}

impl Default for FileTree {
    fn default() -> Self {
        FileTree::new()
    }
}

impl FileTree {
    pub fn new() -> Self {
        FileTree {
            root: Level {
                inner: true,
                dirty: false,
                loaded: true,
                ..Level::default()
            },
            oldroot: Vec::new(),
            journal: BTreeMap::new(),
            replayed: true,
            split_level: DEFAULT_SPLIT_LEVEL,
        }
    }

    fn snapshot_children(&self) -> Vec<ChildRef> {
        self.root
            .levels
            .iter()
            .map(|c| (c.path.clone(), c.etag.clone(), c.last.clone()))
            .collect()
    }

    /// Lower the split factor; tests use this to exercise splits with
    /// small key counts.
    pub fn with_split_level(mut self, n: usize) -> Self {
        self.split_level = n.max(4);
        self
    }

    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    pub fn resident_bytes(&self) -> usize {
        self.root.resident_bytes()
    }

    pub fn should_sync(&self) -> bool {
        self.journal.len() >= SYNC_JOURNAL_LEN || self.resident_bytes() > SYNC_RESIDENT_BYTES
    }

    /// Re-apply journal entries into the tree. Idempotent; runs once per
    /// decoded tree.
    fn replay(&mut self, fs: &dyn InputFs) -> Result<()> {
        if self.replayed {
            return Ok(());
        }
        self.replayed = true;
        let entries: Vec<(String, (String, i64))> = self
            .journal
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        debug!(entries = entries.len(), "replaying input journal");
        for (path, (etag, id)) in entries {
            self.insert(fs, &path, &etag, id, true)?;
        }
        Ok(())
    }

    /// Record an ingested input. Returns `true` when the tree changed.
    ///
    /// Re-appending an identical `(path, etag, id)` is a no-op; a changed
    /// etag for an input that already succeeded is `EtagChanged`; failed
    /// ingests (negative ids) may be overwritten in either direction.
    pub fn append(&mut self, fs: &dyn InputFs, path: &str, etag: &str, id: i64) -> Result<bool> {
        self.replay(fs)?;
        let changed = self.insert(fs, path, etag, id, false)?;
        if changed {
            self.journal
                .insert(path.to_string(), (etag.to_string(), id));
        }
        Ok(changed)
    }

    fn insert(
        &mut self,
        fs: &dyn InputFs,
        path: &str,
        etag: &str,
        id: i64,
        from_journal: bool,
    ) -> Result<bool> {
        let out = Self::insert_level(
            &mut self.root,
            fs,
            path,
            etag,
            id,
            from_journal,
            self.split_level,
        )?;
        if self.root.width() >= self.split_level {
            // grow a new root level: split the children into two inner
            // nodes reached through the (implicit) root
            let sib = self.root.split_half();
            let mut lower = std::mem::take(&mut self.root);
            lower.path = String::new();
            lower.etag = String::new();
            let last = sib.last.clone();
            self.root = Level {
                inner: true,
                dirty: true,
                loaded: true,
                last,
                levels: vec![lower, sib],
                ..Level::default()
            };
            self.root.levels[0].dirty = true;
        }
        Ok(matches!(out, InsertOutcome::Changed))
    }

    fn insert_level(
        lvl: &mut Level,
        fs: &dyn InputFs,
        path: &str,
        etag: &str,
        id: i64,
        from_journal: bool,
        split_level: usize,
    ) -> Result<InsertOutcome> {
        lvl.load(fs)?;
        if !lvl.inner {
            return Self::insert_leaf(lvl, path, etag, id, from_journal);
        }
        if lvl.levels.is_empty() {
            lvl.levels.push(Level::new_leaf());
        }
        let pos = lvl
            .levels
            .iter()
            .position(|c| c.last.as_str() >= path)
            .unwrap_or(lvl.levels.len() - 1);
        let out = Self::insert_level(
            &mut lvl.levels[pos],
            fs,
            path,
            etag,
            id,
            from_journal,
            split_level,
        )?;
        if matches!(out, InsertOutcome::Changed) {
            lvl.dirty = true;
            if lvl.last.as_str() < path {
                lvl.last = path.to_string();
            }
            if lvl.levels[pos].width() >= split_level {
                let sib = lvl.levels[pos].split_half();
                lvl.levels.insert(pos + 1, sib);
            }
        }
        Ok(out)
    }

    fn insert_leaf(
        lvl: &mut Level,
        path: &str,
        etag: &str,
        id: i64,
        from_journal: bool,
    ) -> Result<InsertOutcome> {
        match lvl
            .contents
            .binary_search_by(|e| e.path.as_str().cmp(path))
        {
            Err(pos) => {
                lvl.contents.insert(
                    pos,
                    LeafEntry {
                        path: path.to_string(),
                        etag: etag.to_string(),
                        id,
                    },
                );
                if lvl.last.as_str() < path {
                    lvl.last = path.to_string();
                }
                lvl.dirty = true;
                Ok(InsertOutcome::Changed)
            }
            Ok(pos) => {
                let ent = &mut lvl.contents[pos];
                if ent.etag == etag {
                    if ent.id == id {
                        return Ok(InsertOutcome::Unchanged);
                    }
                    if ent.id >= 0 && id >= 0 {
                        // already ingested successfully; ignore
                        return Ok(InsertOutcome::Unchanged);
                    }
                    // success -> failure, or a failed retry's new code
                    ent.id = id;
                    lvl.dirty = true;
                    return Ok(InsertOutcome::Changed);
                }
                if ent.id < 0 || from_journal {
                    // failure -> success under a fresh etag
                    ent.etag = etag.to_string();
                    ent.id = id;
                    lvl.dirty = true;
                    return Ok(InsertOutcome::Changed);
                }
                Err(Error::EtagChanged {
                    path: path.to_string(),
                    want: ent.etag.clone(),
                    got: etag.to_string(),
                })
            }
        }
    }

    /// Load, in parallel, every child whose key range intersects the
    /// sorted `keys`; with an unreplayed journal, journal keys prefetch
    /// too.
    pub fn prefetch(&mut self, fs: &dyn InputFs, keys: &[String]) {
        let mut want: Vec<&str> = keys.iter().map(String::as_str).collect();
        let journal_keys: Vec<String> = if !self.replayed {
            self.journal.keys().cloned().collect()
        } else {
            Vec::new()
        };
        want.extend(journal_keys.iter().map(String::as_str));
        want.sort_unstable();
        if want.is_empty() || !self.root.loaded {
            return;
        }
        let mut lo = String::new();
        let levels = &mut self.root.levels;
        let spans: Vec<(String, String)> = levels
            .iter()
            .map(|c| {
                let span = (lo.clone(), c.last.clone());
                lo = c.last.clone();
                span
            })
            .collect();
        levels
            .par_iter_mut()
            .zip(spans)
            .for_each(|(child, (lo, hi))| {
                let hit = want
                    .iter()
                    .any(|k| *k > lo.as_str() && *k <= hi.as_str());
                if hit {
                    // best effort: failures surface again on append
                    let _ = child.load(fs);
                }
            });
    }

    /// Write every dirty node through `upload`, bottom-up. `upload`
    /// receives the node's previous backing path (empty when none) and
    /// its compressed encoding, and returns the new (path, etag).
    /// Returns the replaced object paths for quarantine.
    pub fn sync(
        &mut self,
        upload: &(dyn Fn(&str, Vec<u8>) -> Result<(String, String)> + Sync),
    ) -> Result<Vec<String>> {
        let serial = std::sync::Mutex::new(());
        let replaced: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());
        self.root
            .levels
            .par_iter_mut()
            .try_for_each(|child| Self::sync_level(child, upload, &serial, &replaced))?;
        self.journal.clear();
        self.oldroot = self.snapshot_children();
        debug!(children = self.root.levels.len(), "input tree synced");
        Ok(replaced.into_inner().expect("quarantine list"))
    }

    fn sync_level(
        lvl: &mut Level,
        upload: &(dyn Fn(&str, Vec<u8>) -> Result<(String, String)> + Sync),
        serial: &std::sync::Mutex<()>,
        replaced: &std::sync::Mutex<Vec<String>>,
    ) -> Result<()> {
        if !lvl.loaded || !lvl.dirty {
            return Ok(());
        }
        if lvl.inner {
            for child in &mut lvl.levels {
                Self::sync_level(child, upload, serial, replaced)?;
            }
        }
        let packed = compress_block(&lvl.encode_node())?;
        let (new_path, new_etag) = {
            let _guard = serial.lock().expect("sync serialization");
            upload(&lvl.path, packed)?
        };
        if !lvl.path.is_empty() && lvl.path != new_path {
            replaced
                .lock()
                .expect("quarantine list")
                .push(std::mem::take(&mut lvl.path));
        }
        lvl.path = new_path;
        lvl.etag = new_etag;
        lvl.dirty = false;
        Ok(())
    }

    /// In-order traversal starting at the first key >= `start`; clean
    /// leaves are dropped once passed to cap resident memory. The
    /// visitor returns `false` to stop.
    pub fn walk(
        &mut self,
        fs: &dyn InputFs,
        start: &str,
        f: &mut dyn FnMut(&str, &str, i64) -> bool,
    ) -> Result<()> {
        self.replay(fs)?;
        Self::walk_level(&mut self.root, fs, start, &mut |e| f(&e.path, &e.etag, e.id))?;
        Ok(())
    }

    fn walk_level(
        lvl: &mut Level,
        fs: &dyn InputFs,
        start: &str,
        f: &mut dyn FnMut(&LeafEntry) -> bool,
    ) -> Result<bool> {
        if !lvl.inner || !lvl.loaded {
            lvl.load(fs)?;
        }
        if !lvl.inner {
            let from = lvl
                .contents
                .partition_point(|e| e.path.as_str() < start);
            for ent in &lvl.contents[from..] {
                if !f(ent) {
                    return Ok(false);
                }
            }
            if !lvl.dirty {
                // drop the decoded leaf; it can be re-loaded on demand
                lvl.contents = Vec::new();
                lvl.loaded = false;
            }
            return Ok(true);
        }
        for child in &mut lvl.levels {
            if child.last.as_str() < start && !child.last.is_empty() {
                continue;
            }
            if !Self::walk_level(child, fs, start, f)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn encode_inner_list(&self, e: &mut Enc, st: &mut Symtab) {
        let (s_path, s_etag, s_last) =
            (st.intern("path"), st.intern("etag"), st.intern("last"));
        e.begin_list();
        for (path, etag, last) in &self.oldroot {
            e.begin_struct();
            e.field(s_path);
            e.string(path);
            e.field(s_etag);
            e.string(etag);
            e.field(s_last);
            e.string(last);
            e.end();
        }
        e.end();
    }

    /// Encode for embedding in the index object: the plain child list
    /// when the journal is empty, otherwise a struct carrying both the
    /// child list and the journal.
    pub fn encode(&self, e: &mut Enc, st: &mut Symtab) {
        if self.journal.is_empty() {
            self.encode_inner_list(e, st);
            return;
        }
        let (s_inner, s_journal) = (st.intern("inner"), st.intern("journal"));
        let (s_path, s_etag, s_id) = (st.intern("path"), st.intern("etag"), st.intern("id"));
        e.begin_struct();
        e.field(s_inner);
        self.encode_inner_list(e, st);
        e.field(s_journal);
        e.begin_list();
        for (path, (etag, id)) in &self.journal {
            e.begin_struct();
            e.field(s_path);
            e.string(path);
            e.field(s_etag);
            e.string(etag);
            e.field(s_id);
            e.int(*id);
            e.end();
        }
        e.end();
        e.end();
    }

    pub fn decode(d: &Datum<'_>, st: &Symtab) -> Result<FileTree> {
        let mut tree = FileTree::new();
        let mut children = Vec::new();
        match d {
            Datum::List(_) => {
                children = decode_child_list(d, st)?;
            }
            Datum::Struct(fields) => {
                for (sym, val) in fields {
                    match st.name(*sym) {
                        Some("inner") => children = decode_child_list(val, st)?,
                        Some("journal") => {
                            for ent in decode_leaf_entries(val, st)? {
                                tree.journal.insert(ent.path, (ent.etag, ent.id));
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => return Err(Error::corrupt("malformed input tree")),
        }
        tree.root.levels = children;
        tree.root.last = tree
            .root
            .levels
            .last()
            .map(|c| c.last.clone())
            .unwrap_or_default();
        tree.replayed = tree.journal.is_empty();
        tree.oldroot = tree.snapshot_children();
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UploadFs;
    use crate::store_fs::DirFs;

    fn mem_fs() -> (tempfile::TempDir, DirFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        (dir, fs)
    }

    fn uploader_for(fs: &DirFs) -> impl Fn(&str, Vec<u8>) -> Result<(String, String)> + Sync + '_ {
        let n = std::sync::atomic::AtomicU64::new(0);
        move |_old: &str, bytes: Vec<u8>| {
            let k = n.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let path = format!("db/tree/node-{k:06}");
            let etag = fs.write_file(&path, &bytes)?;
            Ok((path, etag))
        }
    }

    #[test]
    fn append_contract() {
        let (_dir, fs) = mem_fs();
        let mut t = FileTree::new();
        // new path
        assert!(t.append(&fs, "a/x.json", "e1", 7).unwrap());
        // identical triple: no change
        assert!(!t.append(&fs, "a/x.json", "e1", 7).unwrap());
        // success -> failure
        assert!(t.append(&fs, "a/x.json", "e1", -1).unwrap());
        // failure -> success with a new etag
        assert!(t.append(&fs, "a/x.json", "e2", 9).unwrap());
        // etag changed on a successful entry
        match t.append(&fs, "a/x.json", "e3", 11) {
            Err(Error::EtagChanged { path, .. }) => assert_eq!(path, "a/x.json"),
            other => panic!("expected EtagChanged, got {other:?}"),
        }
        // same etag re-ingest with a different descriptor id: idempotent
        assert!(!t.append(&fs, "a/x.json", "e2", 12).unwrap());
    }

    #[test]
    fn splits_keep_order_and_lookups() {
        let (_dir, fs) = mem_fs();
        let mut t = FileTree::new().with_split_level(8);
        let mut keys: Vec<String> = (0..200).map(|i| format!("in/{i:05}.json")).collect();
        for (i, k) in keys.iter().enumerate() {
            assert!(t.append(&fs, k, &format!("e{i}"), i as i64).unwrap());
        }
        // re-appending everything is a no-op
        for (i, k) in keys.iter().enumerate() {
            assert!(!t.append(&fs, k, &format!("e{i}"), i as i64).unwrap());
        }
        // walk returns every key in order
        let mut got = Vec::new();
        t.walk(&fs, "", &mut |p, _e, _id| {
            got.push(p.to_string());
            true
        })
        .unwrap();
        keys.sort();
        assert_eq!(got, keys);
    }

    #[test]
    fn walk_from_start_key() {
        let (_dir, fs) = mem_fs();
        let mut t = FileTree::new().with_split_level(6);
        for i in 0..50 {
            t.append(&fs, &format!("k{i:03}"), "e", i).unwrap();
        }
        let mut got = Vec::new();
        t.walk(&fs, "k040", &mut |p, _, _| {
            got.push(p.to_string());
            true
        })
        .unwrap();
        assert_eq!(got.len(), 10);
        assert_eq!(got[0], "k040");
    }

    #[test]
    fn sync_roundtrips_through_backing_store() {
        let (_dir, fs) = mem_fs();
        let up = uploader_for(&fs);
        let mut t = FileTree::new().with_split_level(8);
        for i in 0..100 {
            t.append(&fs, &format!("in/{i:04}"), &format!("e{i}"), i).unwrap();
        }
        let replaced = t.sync(&up).unwrap();
        assert!(replaced.is_empty(), "first sync replaces nothing");
        assert_eq!(t.journal_len(), 0);

        // mutate and re-sync: the rewritten leaves quarantine their old
        // objects
        for i in 100..140 {
            t.append(&fs, &format!("in/{i:04}"), &format!("e{i}"), i).unwrap();
        }
        let replaced = t.sync(&up).unwrap();
        assert!(!replaced.is_empty());

        // encode + decode: the journal is empty, so we get a plain list,
        // and every key is still reachable through the store
        let mut st = Symtab::new();
        let mut e = Enc::new();
        t.encode(&mut e, &mut st);
        let mut d = Dec::new(e.bytes());
        let val = d.value().unwrap();
        let mut t2 = FileTree::decode(&val, &st).unwrap();
        let mut count = 0;
        t2.walk(&fs, "", &mut |_, _, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 140);
    }

    #[test]
    fn journal_replays_after_decode() {
        let (_dir, fs) = mem_fs();
        let up = uploader_for(&fs);
        let mut t = FileTree::new().with_split_level(8);
        for i in 0..30 {
            t.append(&fs, &format!("in/{i:04}"), "e", i).unwrap();
        }
        t.sync(&up).unwrap();
        // journaled-but-unsynced appends
        for i in 30..40 {
            t.append(&fs, &format!("in/{i:04}"), "e", i).unwrap();
        }
        assert_eq!(t.journal_len(), 10);

        let mut st = Symtab::new();
        let mut e = Enc::new();
        t.encode(&mut e, &mut st);
        let mut d = Dec::new(e.bytes());
        let val = d.value().unwrap();
        let mut t2 = FileTree::decode(&val, &st).unwrap();
        assert_eq!(t2.journal_len(), 10);
        // an append touching a journaled key resolves through replay
        assert!(!t2.append(&fs, "in/0035", "e", 35).unwrap());
        let mut count = 0;
        t2.walk(&fs, "", &mut |_, _, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 40);
    }

    #[test]
    fn etag_mismatch_on_load_is_detected() {
        let (_dir, fs) = mem_fs();
        let up = uploader_for(&fs);
        let mut t = FileTree::new();
        for i in 0..10 {
            t.append(&fs, &format!("k{i}"), "e", i).unwrap();
        }
        t.sync(&up).unwrap();
        let mut st = Symtab::new();
        let mut e = Enc::new();
        t.encode(&mut e, &mut st);
        let mut d = Dec::new(e.bytes());
        let val = d.value().unwrap();
        let mut t2 = FileTree::decode(&val, &st).unwrap();

        // clobber the backing node object
        let node = {
            let mut found = String::new();
            t.walk(&fs, "", &mut |_, _, _| true).unwrap();
            for i in 0..100 {
                let p = format!("db/tree/node-{i:06}");
                if fs.stat(&p).is_ok() {
                    found = p;
                }
            }
            found
        };
        std::thread::sleep(std::time::Duration::from_millis(5));
        fs.write_file(&node, b"garbage").unwrap();
        match t2.walk(&fs, "", &mut |_, _, _| true) {
            Err(Error::EtagChanged { .. }) => {}
            other => panic!("expected EtagChanged, got {other:?}"),
        }
    }
}
