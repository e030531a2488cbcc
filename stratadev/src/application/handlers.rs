use std::path::PathBuf;

use strata_core::convert::format::parse_rfc3339_micros;
use strata_core::index::object::{Descriptor, ObjectInfo, FLAG_SKIP_INPUTS, FORMAT_COMPRESSED_V2};
use strata_core::prelude::*;
use strata_core::sdr::OwnedDatum;
use uuid::Uuid;

fn parse_key(hex_key: &str) -> Result<Key> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| Error::Format("signing key must be hex".to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Format("signing key must be 32 bytes".to_string()))?;
    Ok(Key(arr))
}

fn load_index(fs: &DirFs, name: &str, key: &Key, flags: u32) -> Result<Index> {
    let mut r = fs.open(name)?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut r, &mut buf)?;
    decode_index(Some(key), &buf, flags)
}

fn store_index(fs: &DirFs, name: &str, key: &Key, idx: &Index) -> Result<()> {
    let signed = sign(key, idx)?;
    fs.write_file(name, &signed)?;
    Ok(())
}

pub fn handle_create(root: PathBuf, name: String, algo: String, key_hex: String) -> Result<()> {
    let key = parse_key(&key_hex)?;
    let fs = DirFs::new(root);
    let idx = Index::new(&name, &algo);
    store_index(&fs, &name, &key, &idx)?;
    println!("created index {name} (algo {algo})");
    Ok(())
}

/// Expand directory arguments into the files beneath them.
fn expand_inputs(root: &std::path::Path, inputs: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for inp in inputs {
        let full = root.join(&inp);
        if full.is_dir() {
            for e in walkdir::WalkDir::new(&full)
                .follow_links(false)
                .into_iter()
                .flatten()
            {
                if e.file_type().is_file() {
                    if let Ok(rel) = e.path().strip_prefix(root) {
                        out.push(rel.to_string_lossy().to_string());
                    }
                }
            }
        } else {
            out.push(inp);
        }
    }
    out.sort();
    out
}

pub fn handle_append(
    root: PathBuf,
    name: String,
    inputs: Vec<String>,
    key_hex: String,
    align: usize,
    parallel: usize,
) -> Result<()> {
    let key = parse_key(&key_hex)?;
    let fs = DirFs::new(root.clone());
    let mut idx = load_index(&fs, &name, &key, 0)?;

    // idempotence: skip inputs the tree already records under the same
    // etag, and reserve descriptor ids for the rest
    let next_id = (idx.inline.len() + idx.indirect.objects()) as i64;
    let candidates = expand_inputs(&root, inputs);
    let mut fresh = Vec::new();
    for path in candidates {
        let info = fs.stat(&path)?;
        let etag = fs.etag(&path, &info)?;
        if idx.inputs.append(&fs, &path, &etag, next_id)? {
            fresh.push(path);
        }
    }
    if fresh.is_empty() {
        println!("nothing to do: every input is already ingested");
        return Ok(());
    }

    let mut conv = Converter::new(&idx.algo, align);
    conv.parallel = parallel;
    for path in &fresh {
        conv.inputs.push(open_input(&fs, path, None, None)?);
    }
    let packname = format!("db/packfile-{}", Uuid::new_v4());
    let trailer = conv.run(fs.create(&packname)?)?;
    let info = fs.stat(&packname)?;
    idx.inline.push(Descriptor {
        info: ObjectInfo {
            path: packname.clone(),
            etag: info.etag,
            last_modified: info.last_modified,
            format: FORMAT_COMPRESSED_V2.to_string(),
            size: info.size,
        },
        trailer,
    });

    let cfg = IndexConfig::default();
    cfg.sync_outputs(&mut idx, &fs, "db")?;
    if idx.inputs.should_sync() {
        let replaced = {
            let fs = &fs;
            idx.inputs.sync(&|_old, bytes| {
                let p = format!("db/tree/node-{}", Uuid::new_v4());
                let etag = fs.write_file(&p, &bytes)?;
                Ok((p, etag))
            })?
        };
        for p in replaced {
            idx.quarantine(p, cfg.grace_micros);
        }
    }
    store_index(&fs, &name, &key, &idx)?;
    println!(
        "ingested {} inputs into {packname} ({} inline packfiles)",
        fresh.len(),
        idx.inline.len()
    );
    Ok(())
}

pub fn handle_inspect(root: PathBuf, path: String) -> Result<()> {
    let fs = DirFs::new(root);
    let info = fs.stat(&path)?;
    let mut f = fs.open(&path)?;
    let t = Trailer::read_from(&mut f, info.size)?;
    println!("packfile:  {path}");
    println!("algo:      {}", t.algo);
    println!("chunk:     {} bytes", t.chunk_size());
    println!("data:      {} compressed / {} decompressed", t.offset, t.decompressed_size());
    println!("blocks:    {}", t.blocks.len());
    for (i, b) in t.blocks.iter().enumerate() {
        println!("  block {i:4}: offset {:10}  chunks {}", b.offset, b.chunks);
    }
    for path in t.sparse.field_paths() {
        if let Some((lo, hi)) = t.sparse.min_max(path) {
            println!("  range {}: [{lo}, {hi}]", path.join("."));
        }
    }
    Ok(())
}

pub fn handle_query(
    root: PathBuf,
    name: String,
    key_hex: String,
    field: String,
    after: Option<String>,
    before: Option<String>,
) -> Result<()> {
    let key = parse_key(&key_hex)?;
    let fs = DirFs::new(root);
    let idx = load_index(&fs, &name, &key, FLAG_SKIP_INPUTS)?;

    let mut parts = Vec::new();
    if let Some(a) = after {
        let t = parse_rfc3339_micros(&a)
            .ok_or_else(|| Error::Format(format!("bad --after timestamp {a:?}")))?;
        parts.push(Expr::cmp(CmpOp::Ge, &[field.as_str()], OwnedDatum::Timestamp(t)));
    }
    if let Some(b) = before {
        let t = parse_rfc3339_micros(&b)
            .ok_or_else(|| Error::Format(format!("bad --before timestamp {b:?}")))?;
        parts.push(Expr::cmp(CmpOp::Le, &[field.as_str()], OwnedDatum::Timestamp(t)));
    }
    let filter = if parts.is_empty() {
        Filter::all()
    } else {
        Filter::new(Some(Expr::And(parts)))
    };

    for d in &idx.inline {
        if filter.matches_any(&d.trailer.sparse) {
            let mut blocks = 0usize;
            filter.visit(&d.trailer.sparse, |s, e| blocks += e - s);
            println!("{}  blocks {blocks}/{}", d.info.path, d.trailer.blocks.len());
        }
    }
    for d in idx.indirect.search(&fs, &filter)? {
        println!("{}  (indirect)", d.info.path);
    }
    Ok(())
}
