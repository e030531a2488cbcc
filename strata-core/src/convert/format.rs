//! Input row formats. Each variant knows how to turn a byte stream into
//! records fed through the chunker; the suffix table maps object names to
//! (format, transport compression).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::chunker::Chunker;
use crate::error::{Error, Result};
use crate::pack::writer::BlockSink;
use crate::sdr::dec::Dec;
use crate::sdr::sym::Symtab;
use crate::sdr::OwnedDatum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    Datetime,
    String,
    Int,
    Float,
    Bool,
    Ignore,
}

/// Per-field parsing hints for JSON inputs.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SchemaHints {
    pub fields: HashMap<String, HintKind>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct XsvField {
    pub name: String,
    pub kind: HintKind,
}

/// Column schema for CSV/TSV inputs, which carry no self-description.
#[derive(Clone, Debug, Deserialize)]
pub struct XsvSchema {
    pub fields: Vec<XsvField>,
    /// Skip the first line.
    #[serde(default)]
    pub header: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputCompression {
    None,
    Gzip,
    Zstd,
}

#[derive(Clone, Debug)]
pub enum RowFormat {
    Json { hints: Option<SchemaHints> },
    /// AWS Cloudtrail dumps: one object with a `Records` array.
    Cloudtrail,
    Xsv { delim: u8, schema: XsvSchema },
    /// Already-encoded record streams.
    Native,
}

/// Strip a transport-compression suffix, returning the remaining path.
fn split_compression(path: &str) -> (&str, InputCompression) {
    if let Some(rest) = path.strip_suffix(".gz") {
        (rest, InputCompression::Gzip)
    } else if let Some(rest) = path.strip_suffix(".zst") {
        (rest, InputCompression::Zstd)
    } else {
        (path, InputCompression::None)
    }
}

impl RowFormat {
    /// Resolve a format from the object-name suffix. CSV/TSV require a
    /// schema. Returns `None` for unrecognized suffixes so the caller
    /// can consult its own resolver.
    pub fn for_path(
        path: &str,
        hints: Option<SchemaHints>,
        schema: Option<XsvSchema>,
    ) -> Result<Option<(RowFormat, InputCompression)>> {
        if path.ends_with(".cloudtrail.json.gz") {
            return Ok(Some((RowFormat::Cloudtrail, InputCompression::Gzip)));
        }
        let (stem, comp) = split_compression(path);
        let fmt = if stem.ends_with(".json") {
            RowFormat::Json { hints }
        } else if stem.ends_with(".csv") || stem.ends_with(".tsv") {
            let delim = if stem.ends_with(".csv") { b',' } else { b'\t' };
            let schema = schema.ok_or_else(|| {
                Error::NoMatch(format!("{path}: csv/tsv input requires a schema"))
            })?;
            RowFormat::Xsv { delim, schema }
        } else if stem.ends_with(".sdr") {
            RowFormat::Native
        } else {
            return Ok(None);
        };
        Ok(Some((fmt, comp)))
    }

    /// The descriptor tag recorded for an input object.
    pub fn suffix_tag(path: &str) -> &str {
        if path.ends_with(".cloudtrail.json.gz") {
            return "cloudtrail.json.gz";
        }
        for tag in [
            "json.gz", "json.zst", "json", "csv.gz", "csv.zst", "csv", "tsv.gz", "tsv.zst",
            "tsv", "sdr",
        ] {
            if path.ends_with(&format!(".{tag}")) {
                return tag;
            }
        }
        ""
    }

    /// Feed every row from `src` through `chunker`. Fields listed in
    /// `constants` are stripped from rows; their value is recorded once
    /// in the packfile trailer instead.
    pub fn convert<W: BlockSink>(
        &self,
        src: Box<dyn Read + Send>,
        chunker: &mut Chunker<W>,
        constants: &[(String, OwnedDatum)],
    ) -> Result<()> {
        match self {
            RowFormat::Json { hints } => convert_json(src, chunker, hints.as_ref(), constants),
            RowFormat::Cloudtrail => convert_cloudtrail(src, chunker, constants),
            RowFormat::Xsv { delim, schema } => {
                convert_xsv(src, chunker, *delim, schema, constants)
            }
            RowFormat::Native => convert_native(src, chunker, constants),
        }
    }
}

/// Wrap transport decompression around a raw reader.
pub fn wrap_reader(
    src: Box<dyn Read + Send>,
    comp: InputCompression,
) -> Result<Box<dyn Read + Send>> {
    Ok(match comp {
        InputCompression::None => src,
        InputCompression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(src)),
        InputCompression::Zstd => Box::new(zstd::stream::read::Decoder::new(src)?),
    })
}

fn looks_like_datetime(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 19
        && b.len() <= 35
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[7] == b'-'
        && (b[10] == b'T' || b[10] == b' ')
}

pub fn parse_rfc3339_micros(s: &str) -> Option<i64> {
    let dt = OffsetDateTime::parse(s, &Rfc3339).ok()?;
    Some((dt.unix_timestamp_nanos() / 1_000) as i64)
}

fn json_value(v: &serde_json::Value, hint: Option<HintKind>) -> Result<OwnedDatum> {
    Ok(match v {
        serde_json::Value::Null => OwnedDatum::Null,
        serde_json::Value::Bool(b) => OwnedDatum::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                OwnedDatum::Int(i)
            } else {
                OwnedDatum::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => match hint {
            Some(HintKind::String) => OwnedDatum::String(s.clone()),
            Some(HintKind::Datetime) => match parse_rfc3339_micros(s) {
                Some(t) => OwnedDatum::Timestamp(t),
                None => {
                    return Err(Error::NoMatch(format!(
                        "field hinted as datetime does not parse: {s:?}"
                    )));
                }
            },
            Some(HintKind::Int) => OwnedDatum::Int(
                s.parse::<i64>()
                    .map_err(|_| Error::NoMatch(format!("field hinted as int: {s:?}")))?,
            ),
            _ => {
                if looks_like_datetime(s) {
                    match parse_rfc3339_micros(s) {
                        Some(t) => OwnedDatum::Timestamp(t),
                        None => OwnedDatum::String(s.clone()),
                    }
                } else {
                    OwnedDatum::String(s.clone())
                }
            }
        },
        serde_json::Value::Array(items) => OwnedDatum::List(
            items
                .iter()
                .map(|it| json_value(it, None))
                .collect::<Result<_>>()?,
        ),
        serde_json::Value::Object(fields) => OwnedDatum::Struct(
            fields
                .iter()
                .map(|(k, val)| Ok((k.clone(), json_value(val, None)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn json_record(
    v: &serde_json::Value,
    hints: Option<&SchemaHints>,
    constants: &[(String, OwnedDatum)],
) -> Result<OwnedDatum> {
    let obj = v
        .as_object()
        .ok_or_else(|| Error::NoMatch("top-level JSON value is not an object".to_string()))?;
    let mut fields = Vec::with_capacity(obj.len());
    for (name, val) in obj {
        let hint = hints.and_then(|h| h.fields.get(name)).copied();
        if hint == Some(HintKind::Ignore) {
            continue;
        }
        if constants.iter().any(|(c, _)| c == name) {
            continue;
        }
        fields.push((name.clone(), json_value(val, hint)?));
    }
    Ok(OwnedDatum::Struct(fields))
}

fn map_json_err(e: serde_json::Error) -> Error {
    match e.classify() {
        serde_json::error::Category::Io => Error::Io(std::io::Error::other(e)),
        _ => Error::NoMatch(format!("json: {e}")),
    }
}

fn convert_json<W: BlockSink>(
    src: Box<dyn Read + Send>,
    chunker: &mut Chunker<W>,
    hints: Option<&SchemaHints>,
    constants: &[(String, OwnedDatum)],
) -> Result<()> {
    let stream = serde_json::Deserializer::from_reader(BufReader::new(src))
        .into_iter::<serde_json::Value>();
    for item in stream {
        let v = item.map_err(map_json_err)?;
        chunker.write_record(&json_record(&v, hints, constants)?)?;
    }
    Ok(())
}

fn convert_cloudtrail<W: BlockSink>(
    src: Box<dyn Read + Send>,
    chunker: &mut Chunker<W>,
    constants: &[(String, OwnedDatum)],
) -> Result<()> {
    let v: serde_json::Value =
        serde_json::from_reader(BufReader::new(src)).map_err(map_json_err)?;
    let records = v
        .get("Records")
        .and_then(|r| r.as_array())
        .ok_or_else(|| Error::NoMatch("cloudtrail object has no Records array".to_string()))?;
    for rec in records {
        chunker.write_record(&json_record(rec, None, constants)?)?;
    }
    Ok(())
}

/// Minimal CSV field splitting: double quotes guard delimiters, doubled
/// quotes escape themselves. TSV inputs use no quoting.
fn split_line(line: &str, delim: u8) -> Vec<String> {
    if delim == b'\t' {
        return line.split('\t').map(|s| s.to_string()).collect();
    }
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    cur.push('"');
                } else {
                    quoted = false;
                }
            } else {
                cur.push(c);
            }
        } else if c == '"' {
            quoted = true;
        } else if c == delim as char {
            out.push(std::mem::take(&mut cur));
        } else {
            cur.push(c);
        }
    }
    out.push(cur);
    out
}

fn xsv_value(raw: &str, kind: HintKind) -> Result<OwnedDatum> {
    if raw.is_empty() {
        return Ok(OwnedDatum::Null);
    }
    Ok(match kind {
        HintKind::String => OwnedDatum::String(raw.to_string()),
        HintKind::Int => OwnedDatum::Int(
            raw.parse::<i64>()
                .map_err(|_| Error::NoMatch(format!("bad integer field {raw:?}")))?,
        ),
        HintKind::Float => OwnedDatum::Float(
            raw.parse::<f64>()
                .map_err(|_| Error::NoMatch(format!("bad float field {raw:?}")))?,
        ),
        HintKind::Bool => match raw {
            "true" | "TRUE" | "1" => OwnedDatum::Bool(true),
            "false" | "FALSE" | "0" => OwnedDatum::Bool(false),
            _ => return Err(Error::NoMatch(format!("bad bool field {raw:?}"))),
        },
        HintKind::Datetime => OwnedDatum::Timestamp(
            parse_rfc3339_micros(raw)
                .ok_or_else(|| Error::NoMatch(format!("bad datetime field {raw:?}")))?,
        ),
        HintKind::Ignore => OwnedDatum::Null,
    })
}

fn convert_xsv<W: BlockSink>(
    src: Box<dyn Read + Send>,
    chunker: &mut Chunker<W>,
    delim: u8,
    schema: &XsvSchema,
    constants: &[(String, OwnedDatum)],
) -> Result<()> {
    let reader = BufReader::new(src);
    let mut first = schema.header;
    for line in reader.lines() {
        let line = line?;
        if std::mem::take(&mut first) || line.is_empty() {
            continue;
        }
        let cols = split_line(&line, delim);
        if cols.len() != schema.fields.len() {
            return Err(Error::NoMatch(format!(
                "row has {} columns, schema has {}",
                cols.len(),
                schema.fields.len()
            )));
        }
        let mut fields = Vec::with_capacity(cols.len());
        for (raw, def) in cols.iter().zip(&schema.fields) {
            if def.kind == HintKind::Ignore || constants.iter().any(|(c, _)| c == &def.name) {
                continue;
            }
            fields.push((def.name.clone(), xsv_value(raw, def.kind)?));
        }
        chunker.write_record(&OwnedDatum::Struct(fields))?;
    }
    Ok(())
}

fn convert_native<W: BlockSink>(
    mut src: Box<dyn Read + Send>,
    chunker: &mut Chunker<W>,
    constants: &[(String, OwnedDatum)],
) -> Result<()> {
    let mut buf = Vec::new();
    src.read_to_end(&mut buf)?;
    let mut st = Symtab::new();
    let mut d = Dec::new(&buf);
    while !d.done() {
        d.skip_pads();
        if d.done() {
            break;
        }
        if d.at_bvm() || matches!(d.peek(), Some(t) if t >> 4 == crate::sdr::TYPE_ANNOTATION) {
            st.read_block_header(&mut d)?;
            continue;
        }
        let rec = d.value()?.to_owned(&st)?;
        match rec {
            OwnedDatum::Struct(mut fields) => {
                fields.retain(|(name, _)| !constants.iter().any(|(c, _)| c == name));
                chunker.write_record(&OwnedDatum::Struct(fields))?;
            }
            _ => return Err(Error::NoMatch("native stream value is not a record".to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::sparse::FieldPath;

    #[derive(Default)]
    struct Sink {
        chunks: usize,
    }
    impl BlockSink for Sink {
        fn write_chunk(&mut self, _chunk: &[u8]) -> Result<()> {
            self.chunks += 1;
            Ok(())
        }
        fn set_min_max(&mut self, _path: &[String], _min: i64, _max: i64) {}
        fn flush_meta(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn suffix_table() {
        assert!(matches!(
            RowFormat::for_path("a/b/events.json", None, None).unwrap(),
            Some((RowFormat::Json { .. }, InputCompression::None))
        ));
        assert!(matches!(
            RowFormat::for_path("x.json.gz", None, None).unwrap(),
            Some((RowFormat::Json { .. }, InputCompression::Gzip))
        ));
        assert!(matches!(
            RowFormat::for_path("x.cloudtrail.json.gz", None, None).unwrap(),
            Some((RowFormat::Cloudtrail, InputCompression::Gzip))
        ));
        // csv without a schema is a hard error, not a fallback
        assert!(RowFormat::for_path("x.csv.zst", None, None).is_err());
        assert!(RowFormat::for_path("x.parquet", None, None)
            .unwrap()
            .is_none());
        assert_eq!(RowFormat::suffix_tag("a/x.json.gz"), "json.gz");
        assert_eq!(RowFormat::suffix_tag("a/x.tsv"), "tsv");
    }

    #[test]
    fn json_rows_with_timestamps() {
        let data = br#"
            {"ts": "2024-03-01T10:00:00Z", "name": "a", "n": 1}
            {"ts": "2024-03-01T10:00:01Z", "name": "b", "n": 2}
        "#;
        let mut ch = Chunker::new(Sink::default(), 1024, 4096);
        let fmt = RowFormat::Json { hints: None };
        fmt.convert(Box::new(&data[..]), &mut ch, &[]).unwrap();
        ch.finish().unwrap();
        // the ts fields must have been tracked as timestamps: the
        // chunker only tracks OwnedDatum::Timestamp values
        assert_eq!(ch.chunks_written(), 1);
    }

    #[test]
    fn json_garbage_is_fatal_no_match() {
        let mut ch = Chunker::new(Sink::default(), 1024, 4096);
        let fmt = RowFormat::Json { hints: None };
        let err = fmt
            .convert(Box::new(&b"{not json"[..]), &mut ch, &[])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn csv_with_schema_and_quotes() {
        let data = b"ts,msg,n\n2024-03-01T00:00:00Z,\"hello, world\",3\n";
        let schema = XsvSchema {
            fields: vec![
                XsvField {
                    name: "ts".into(),
                    kind: HintKind::Datetime,
                },
                XsvField {
                    name: "msg".into(),
                    kind: HintKind::String,
                },
                XsvField {
                    name: "n".into(),
                    kind: HintKind::Int,
                },
            ],
            header: true,
        };
        let mut ch = Chunker::new(Sink::default(), 1024, 4096);
        let fmt = RowFormat::Xsv {
            delim: b',',
            schema,
        };
        fmt.convert(Box::new(&data[..]), &mut ch, &[]).unwrap();
        ch.finish().unwrap();
        assert_eq!(ch.chunks_written(), 1);
    }

    #[test]
    fn constants_are_stripped_from_rows() {
        let data = br#"{"tenant": "acme", "n": 1}"#;
        struct Grab {
            ranges: Vec<FieldPath>,
        }
        impl BlockSink for Grab {
            fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
                // the record must not mention the constant field
                assert!(!chunk.windows(6).any(|w| w == b"tenant"));
                Ok(())
            }
            fn set_min_max(&mut self, path: &[String], _min: i64, _max: i64) {
                self.ranges.push(path.to_vec());
            }
            fn flush_meta(&mut self) -> Result<()> {
                Ok(())
            }
        }
        let mut ch = Chunker::new(Grab { ranges: Vec::new() }, 512, 512);
        let consts = vec![(
            "tenant".to_string(),
            OwnedDatum::String("acme".to_string()),
        )];
        RowFormat::Json { hints: None }
            .convert(Box::new(&data[..]), &mut ch, &consts)
            .unwrap();
        ch.finish().unwrap();
    }

    #[test]
    fn datetime_detection_is_guarded() {
        assert!(looks_like_datetime("2024-03-01T10:00:00Z"));
        assert!(!looks_like_datetime("not a date"));
        assert!(!looks_like_datetime("12345678901234567890"));
        assert_eq!(
            parse_rfc3339_micros("1970-01-01T00:00:01Z"),
            Some(1_000_000)
        );
    }
}
