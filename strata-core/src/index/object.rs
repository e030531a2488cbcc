//! The signed index object: the root of a table's state. It binds the
//! hot set of packfile descriptors (inline), the cold set behind the
//! indirect tree, the journaled input tree, and the quarantine list, and
//! is authenticated end-to-end with a keyed MAC so it can live on
//! untrusted storage.

use time::OffsetDateTime;
use tracing::debug;

use super::filetree::FileTree;
use super::indirect::IndirectTree;
use crate::codec::zstd::{compress_block, decompress_block};
use crate::error::{Error, Result};
use crate::pack::concat::Concat;
use crate::pack::trailer::Trailer;
use crate::sdr::dec::{Datum, Dec};
use crate::sdr::enc::Enc;
use crate::sdr::sym::Symtab;
use crate::sdr::OwnedDatum;
use crate::store::UploadFs;

pub const INDEX_VERSION: i64 = 1;

/// Format tag recorded on packfile outputs.
pub const FORMAT_COMPRESSED_V2: &str = "blockfmt/compressed/v2";

/// Skip decoding the input tree and quarantine list (query-time shortcut).
pub const FLAG_SKIP_INPUTS: u32 = 1;

/// Compress the embedded input tree when its encoding reaches this size.
const INPUTS_COMPRESS_MIN: usize = 1 << 10;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

pub fn now_micros() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64
}

/// Signing key for index objects.
pub struct Key(pub [u8; 32]);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectInfo {
    pub path: String,
    pub etag: String,
    /// Microseconds since the Unix epoch.
    pub last_modified: i64,
    /// Codec-version tag for outputs, parser suffix tag for inputs.
    pub format: String,
    pub size: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Descriptor {
    pub info: ObjectInfo,
    pub trailer: Trailer,
}

impl Descriptor {
    pub fn encode_struct(&self, e: &mut Enc, st: &mut Symtab) {
        let (s_path, s_etag, s_lm, s_format, s_size, s_trailer) = (
            st.intern("path"),
            st.intern("etag"),
            st.intern("last-modified"),
            st.intern("format"),
            st.intern("size"),
            st.intern("trailer"),
        );
        e.begin_struct();
        e.field(s_path);
        e.string(&self.info.path);
        e.field(s_etag);
        e.string(&self.info.etag);
        e.field(s_lm);
        e.timestamp(self.info.last_modified);
        e.field(s_format);
        e.string(&self.info.format);
        e.field(s_size);
        e.int(self.info.size);
        e.field(s_trailer);
        self.trailer.encode_struct(e, st);
        e.end();
    }

    pub fn decode_struct(d: &Datum<'_>, st: &Symtab) -> Result<Descriptor> {
        let mut out = Descriptor::default();
        for (sym, val) in d.as_struct()? {
            match st.name(*sym) {
                Some("path") => out.info.path = val.as_str()?.to_string(),
                Some("etag") => out.info.etag = val.as_str()?.to_string(),
                Some("last-modified") => out.info.last_modified = val.as_timestamp()?,
                Some("format") => out.info.format = val.as_str()?.to_string(),
                Some("size") => out.info.size = val.as_int()?,
                Some("trailer") => out.trailer = Trailer::decode_struct(val, st)?,
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quarantined {
    pub path: String,
    /// Expiry, microseconds since the Unix epoch; a garbage collector
    /// removes the object after this time.
    pub expiry: i64,
}

#[derive(Debug, Default)]
pub struct Index {
    pub name: String,
    pub created: i64,
    pub user_data: Option<OwnedDatum>,
    pub algo: String,
    pub inline: Vec<Descriptor>,
    pub indirect: IndirectTree,
    pub inputs: FileTree,
    pub to_delete: Vec<Quarantined>,
    pub last_scan: i64,
    pub cursors: Vec<String>,
    pub scanning: bool,
}

impl Index {
    pub fn new(name: &str, algo: &str) -> Self {
        Index {
            name: name.to_string(),
            created: now_micros(),
            algo: algo.to_string(),
            ..Index::default()
        }
    }

    /// Schedule `path` for deletion after the grace period.
    pub fn quarantine(&mut self, path: String, grace_micros: i64) {
        self.to_delete.push(Quarantined {
            path,
            expiry: now_micros() + grace_micros,
        });
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let mut st = Symtab::new();
        let mut e = Enc::new();
        let s_version = st.intern("version");
        let s_name = st.intern("name");
        let s_created = st.intern("created");
        let s_user = st.intern("user-data");
        let s_algo = st.intern("algo");
        let s_contents = st.intern("contents");
        let s_indirect = st.intern("indirect");
        let s_inputs = st.intern("inputs");
        let s_delete = st.intern("to-delete");
        let s_scan = st.intern("last-scan");
        let s_cursors = st.intern("cursors");
        let s_scanning = st.intern("scanning");
        let (s_path, s_expiry) = (st.intern("path"), st.intern("expiry"));

        e.begin_struct();
        e.field(s_version);
        e.int(INDEX_VERSION);
        e.field(s_name);
        e.string(&self.name);
        e.field(s_created);
        e.timestamp(self.created);
        if let Some(u) = &self.user_data {
            e.field(s_user);
            e.datum(u, &mut st);
        }
        e.field(s_algo);
        e.string(&self.algo);
        if !self.inline.is_empty() {
            // descriptor lists compress well and dominate the body
            let mut inner_st = Symtab::new();
            let mut inner = Enc::new();
            inner.begin_list();
            for d in &self.inline {
                d.encode_struct(&mut inner, &mut inner_st);
            }
            inner.end();
            let mut raw = Vec::new();
            inner_st.encode_full(&mut raw);
            raw.extend_from_slice(inner.bytes());
            let packed = compress_block(&raw)?;
            e.field(s_contents);
            e.blob(&packed);
        }
        e.field(s_indirect);
        self.indirect.encode(&mut e, &mut st);
        {
            let mut inner_st = Symtab::new();
            let mut inner = Enc::new();
            self.inputs.encode(&mut inner, &mut inner_st);
            let mut raw = Vec::new();
            inner_st.encode_full(&mut raw);
            raw.extend_from_slice(inner.bytes());
            let blob = if raw.len() >= INPUTS_COMPRESS_MIN {
                compress_block(&raw)?
            } else {
                raw
            };
            e.field(s_inputs);
            e.blob(&blob);
        }
        e.field(s_delete);
        e.begin_list();
        for q in &self.to_delete {
            e.begin_struct();
            e.field(s_path);
            e.string(&q.path);
            e.field(s_expiry);
            e.timestamp(q.expiry);
            e.end();
        }
        e.end();
        e.field(s_scan);
        e.timestamp(self.last_scan);
        e.field(s_cursors);
        e.begin_list();
        for c in &self.cursors {
            e.string(c);
        }
        e.end();
        e.field(s_scanning);
        e.bool(self.scanning);
        e.end();

        let mut out = Vec::new();
        st.encode_full(&mut out);
        out.extend_from_slice(e.bytes());
        Ok(out)
    }
}

fn mac(key: &Key, body: &[u8]) -> [u8; 32] {
    let digest = blake2b_simd::Params::new()
        .hash_length(32)
        .key(&key.0)
        .to_state()
        .update(body)
        .finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Serialize and sign: `body || 0x0E 0xA0 || blake2b-256(key, body||pad)`.
/// The two-byte NOP pad declares the MAC's length, so generic record
/// tools skip the signature cleanly.
pub fn sign(key: &Key, index: &Index) -> Result<Vec<u8>> {
    let mut out = index.encode_body()?;
    out.extend_from_slice(&[0x0E, 0xA0]);
    let tag = mac(key, &out);
    out.extend_from_slice(&tag);
    debug!(name = %index.name, bytes = out.len(), "signed index");
    Ok(out)
}

/// Verify and decode a signed index. Pass `key = None` to skip MAC
/// verification for offline introspection.
pub fn decode_index(key: Option<&Key>, buf: &[u8], flags: u32) -> Result<Index> {
    if buf.len() < 34 {
        return Err(Error::BadMac);
    }
    let body_end = buf.len() - 34;
    if buf[body_end..body_end + 2] != [0x0E, 0xA0] {
        return Err(Error::BadMac);
    }
    if let Some(key) = key {
        let want = mac(key, &buf[..body_end + 2]);
        if !ct_eq(&want, &buf[body_end + 2..]) {
            return Err(Error::BadMac);
        }
    }
    decode_body(&buf[..body_end], flags)
}

fn decode_body(body: &[u8], flags: u32) -> Result<Index> {
    let mut st = Symtab::new();
    let mut d = Dec::new(body);
    st.read_block_header(&mut d)?;
    let root = d.value()?;
    let mut out = Index::default();
    let mut version = 0i64;
    for (sym, val) in root.as_struct()? {
        match st.name(*sym) {
            Some("version") => version = val.as_int()?,
            Some("name") => out.name = val.as_str()?.to_string(),
            Some("created") => out.created = val.as_timestamp()?,
            Some("user-data") => out.user_data = Some(val.to_owned(&st)?),
            Some("algo") => out.algo = val.as_str()?.to_string(),
            Some("contents") => {
                let raw = decompress_block(val.as_blob()?)?;
                let mut ist = Symtab::new();
                let mut id = Dec::new(&raw);
                ist.read_block_header(&mut id)?;
                for item in id.value()?.as_list()? {
                    out.inline.push(Descriptor::decode_struct(item, &ist)?);
                }
            }
            Some("indirect") => out.indirect = IndirectTree::decode(val, &st)?,
            Some("inputs") if flags & FLAG_SKIP_INPUTS == 0 => {
                let blob = val.as_blob()?;
                let raw;
                let bytes = if blob.starts_with(&ZSTD_MAGIC) {
                    raw = decompress_block(blob)?;
                    raw.as_slice()
                } else {
                    blob
                };
                let mut ist = Symtab::new();
                let mut id = Dec::new(bytes);
                ist.read_block_header(&mut id)?;
                out.inputs = FileTree::decode(&id.value()?, &ist)?;
            }
            Some("to-delete") if flags & FLAG_SKIP_INPUTS == 0 => {
                for item in val.as_list()? {
                    let mut q = Quarantined {
                        path: String::new(),
                        expiry: 0,
                    };
                    for (fsym, fval) in item.as_struct()? {
                        match st.name(*fsym) {
                            Some("path") => q.path = fval.as_str()?.to_string(),
                            Some("expiry") => q.expiry = fval.as_timestamp()?,
                            _ => {}
                        }
                    }
                    out.to_delete.push(q);
                }
            }
            Some("last-scan") => out.last_scan = val.as_timestamp()?,
            Some("cursors") => {
                for item in val.as_list()? {
                    out.cursors.push(item.as_str()?.to_string());
                }
            }
            Some("scanning") => {
                out.scanning = matches!(val, Datum::Bool(true));
            }
            _ => {}
        }
    }
    if version != INDEX_VERSION {
        return Err(Error::Obsolete(version));
    }
    Ok(out)
}

#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Decompressed inline bytes tolerated before compaction.
    pub max_inlined: i64,
    /// Target size for compacted packfiles.
    pub target_size: usize,
    /// Size at which an indirect ref stops absorbing appends.
    pub target_ref_size: i64,
    /// Quarantine grace period.
    pub grace_micros: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            max_inlined: 128 << 20,
            target_size: 64 << 20,
            target_ref_size: 256 << 10,
            grace_micros: 15 * 60 * 1_000_000,
        }
    }
}

impl IndexConfig {
    /// When the inline set has grown past `max_inlined` decompressed
    /// bytes, concatenate the older half into larger packfiles (grouped
    /// by parent directory) and move their descriptors into the indirect
    /// tree.
    pub fn sync_outputs(
        &self,
        idx: &mut Index,
        fs: &dyn UploadFs,
        basedir: &str,
    ) -> Result<()> {
        let inline_size: i64 = idx
            .inline
            .iter()
            .map(|d| d.trailer.decompressed_size())
            .sum();
        if inline_size < self.max_inlined || idx.inline.len() < 2 {
            return Ok(());
        }
        let half = idx.inline.len() / 2;
        let old: Vec<Descriptor> = idx.inline.drain(..half).collect();
        debug!(
            moved = old.len(),
            inline_bytes = inline_size,
            "compacting inline descriptors"
        );

        let mut groups: Vec<(String, Vec<Descriptor>)> = Vec::new();
        for d in old {
            let parent = match d.info.path.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            };
            match groups.iter_mut().find(|(g, _)| *g == parent) {
                Some((_, v)) => v.push(d),
                None => groups.push((parent, vec![d])),
            }
        }

        let mut packed: Vec<(Descriptor, usize)> = Vec::new();
        for (dir, descs) in groups {
            let mut cat = Concat::new();
            let mut consumed: Vec<String> = Vec::new();
            for d in descs {
                cat.add(&d)?;
                consumed.push(d.info.path.clone());
                if cat.data_len() as usize >= self.target_size {
                    packed.push(flush_group(fs, &dir, cat, &mut consumed, idx, self)?);
                    cat = Concat::new();
                }
            }
            if cat.inputs() > 0 {
                packed.push(flush_group(fs, &dir, cat, &mut consumed, idx, self)?);
            }
        }
        let (descs, origs): (Vec<Descriptor>, Vec<usize>) = packed.into_iter().unzip();
        let orig_total = origs.iter().sum();
        let mut dead: Vec<String> = Vec::new();
        idx.indirect.append(
            fs,
            basedir,
            descs,
            orig_total,
            self.target_ref_size,
            &mut |path| dead.push(path),
        )?;
        for p in dead {
            idx_quarantine(&mut idx.to_delete, p, self.grace_micros);
        }
        Ok(())
    }
}

fn idx_quarantine(to_delete: &mut Vec<Quarantined>, path: String, grace: i64) {
    to_delete.push(Quarantined {
        path,
        expiry: now_micros() + grace,
    });
}

fn flush_group(
    fs: &dyn UploadFs,
    dir: &str,
    cat: Concat,
    consumed: &mut Vec<String>,
    idx: &mut Index,
    cfg: &IndexConfig,
) -> Result<(Descriptor, usize)> {
    let name = if dir.is_empty() {
        format!("packed-{}", uuid::Uuid::new_v4())
    } else {
        format!("{dir}/packed-{}", uuid::Uuid::new_v4())
    };
    let count = cat.inputs();
    let trailer = cat.run(fs, &name)?;
    let info = fs.stat(&name)?;
    for p in consumed.drain(..) {
        idx_quarantine(&mut idx.to_delete, p, cfg.grace_micros);
    }
    Ok((
        Descriptor {
            info: ObjectInfo {
                path: name,
                etag: info.etag,
                last_modified: info.last_modified,
                format: FORMAT_COMPRESSED_V2.to_string(),
                size: info.size,
            },
            trailer,
        },
        count,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::trailer::BlockDesc;

    fn sample_desc(path: &str, lo: i64, hi: i64) -> Descriptor {
        let mut t = Trailer::new("zstd", 10);
        t.blocks.push(BlockDesc {
            offset: 0,
            chunks: 4,
        });
        t.offset = 4096;
        t.sparse.push(&[String::from("ts")], lo, hi);
        t.sparse.bump();
        Descriptor {
            info: ObjectInfo {
                path: path.to_string(),
                etag: format!("etag-{path}"),
                last_modified: 1_700_000_000_000_000,
                format: FORMAT_COMPRESSED_V2.to_string(),
                size: 4242,
            },
            trailer: t,
        }
    }

    fn sample_index(n: usize) -> Index {
        let mut idx = Index::new("db/table", "zstd");
        for i in 0..n {
            idx.inline
                .push(sample_desc(&format!("db/p{i:04}"), i as i64 * 100, i as i64 * 100 + 99));
        }
        idx.user_data = Some(OwnedDatum::Struct(vec![(
            "owner".to_string(),
            OwnedDatum::String("tests".to_string()),
        )]));
        idx
    }

    #[test]
    fn sign_decode_roundtrip() {
        let key = Key([7u8; 32]);
        let idx = sample_index(10);
        let signed = sign(&key, &idx).unwrap();
        let got = decode_index(Some(&key), &signed, 0).unwrap();
        assert_eq!(got.name, idx.name);
        assert_eq!(got.algo, "zstd");
        assert_eq!(got.inline.len(), 10);
        assert_eq!(got.inline[3], idx.inline[3]);
        assert_eq!(got.user_data, idx.user_data);
    }

    #[test]
    fn any_bit_flip_fails_the_mac() {
        let key = Key([9u8; 32]);
        let idx = sample_index(3);
        let signed = sign(&key, &idx).unwrap();
        // probe a spread of bit positions across the signed bytes
        for pos in (0..signed.len()).step_by(signed.len() / 40 + 1) {
            for bit in [0u8, 3, 7] {
                let mut bad = signed.clone();
                bad[pos] ^= 1 << bit;
                match decode_index(Some(&key), &bad, 0) {
                    Err(Error::BadMac) => {}
                    other => panic!("bit flip at {pos}/{bit} yielded {other:?}"),
                }
            }
        }
    }

    #[test]
    fn wrong_key_fails() {
        let idx = sample_index(1);
        let signed = sign(&Key([1u8; 32]), &idx).unwrap();
        assert!(matches!(
            decode_index(Some(&Key([2u8; 32])), &signed, 0),
            Err(Error::BadMac)
        ));
        // introspection without a key still decodes
        assert!(decode_index(None, &signed, 0).is_ok());
    }

    #[test]
    fn skip_inputs_flag() {
        let key = Key([3u8; 32]);
        let mut idx = sample_index(2);
        idx.quarantine("dead/object".to_string(), 1_000_000);
        let signed = sign(&key, &idx).unwrap();
        let got = decode_index(Some(&key), &signed, FLAG_SKIP_INPUTS).unwrap();
        assert!(got.to_delete.is_empty());
        let full = decode_index(Some(&key), &signed, 0).unwrap();
        assert_eq!(full.to_delete.len(), 1);
    }

    #[test]
    fn large_input_set_roundtrip() {
        use crate::store_fs::DirFs;
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let key = Key([5u8; 32]);
        let mut idx = sample_index(1);
        for i in 0..5_000 {
            idx.inputs
                .append(&fs, &format!("s3://in/{i:06}.json"), &format!("e{i}"), i)
                .unwrap();
        }
        let signed = sign(&key, &idx).unwrap();
        let got = decode_index(Some(&key), &signed, 0).unwrap();
        assert_eq!(got.inputs.journal_len(), idx.inputs.journal_len());
        // re-sign the decoded object; it must verify and decode again
        let signed2 = sign(&key, &got).unwrap();
        let got2 = decode_index(Some(&key), &signed2, 0).unwrap();
        assert_eq!(got2.name, idx.name);
    }
}
