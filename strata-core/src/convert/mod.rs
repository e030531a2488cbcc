//! Input-to-packfile conversion: fans parsed row streams out over one or
//! more compression writers, with bounded prefetch and optional prepend
//! of an existing packfile.

use std::io::Read;
use std::mem;

use crossbeam_channel::unbounded;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pack::multi::MultiWriter;
use crate::pack::trailer::Trailer;
use crate::pack::writer::{CompressionWriter, WriterConfig};
use crate::sdr::OwnedDatum;
use crate::store::{InputFs, ReadSeek, Uploader};

pub mod chunker;
pub mod format;
pub mod prefetch;
pub mod splice;

pub use chunker::Chunker;
pub use format::{HintKind, RowFormat, SchemaHints, XsvField, XsvSchema};

use prefetch::do_prefetch;
use splice::splice_packfile;

/// Default metadata-flush interval, in chunks.
pub const DEFAULT_FLUSH_CHUNKS: usize = 50;
pub const DEFAULT_MAX_READS: usize = 8;
pub const DEFAULT_MAX_BYTES_IN_FLIGHT: i64 = 64 << 20;

/// Conservative expansion estimate for compressed inputs when balancing
/// work across threads.
const COMPRESSED_WEIGHT: i64 = 5;

pub struct Input {
    pub path: String,
    pub etag: String,
    pub size: i64,
    pub reader: Option<Box<dyn Read + Send>>,
    pub format: RowFormat,
    /// Set when this input failed; survives the aborted run for callers
    /// to inspect.
    pub err: Option<Error>,
}

impl Input {
    fn weighted_size(&self) -> i64 {
        if self.path.ends_with(".gz") || self.path.ends_with(".zst") {
            self.size.saturating_mul(COMPRESSED_WEIGHT)
        } else {
            self.size
        }
    }
}

/// Open `path` on `fs` and resolve its row format from the suffix.
pub fn open_input(
    fs: &dyn InputFs,
    path: &str,
    hints: Option<SchemaHints>,
    schema: Option<XsvSchema>,
) -> Result<Input> {
    let info = fs.stat(path)?;
    let (fmt, comp) = RowFormat::for_path(path, hints, schema)?
        .ok_or_else(|| Error::NoMatch(format!("{path}: unrecognized input suffix")))?;
    let raw = fs.open(path)?;
    let reader = format::wrap_reader(Box::new(raw), comp)?;
    Ok(Input {
        path: path.to_string(),
        etag: info.etag,
        size: info.size,
        reader: Some(reader),
        format: fmt,
        err: None,
    })
}

pub struct Prepend {
    pub reader: Box<dyn ReadSeek>,
    pub trailer: Trailer,
}

pub struct Converter {
    pub algo: String,
    pub align: usize,
    /// Bytes of decompressed chunk data between metadata flushes.
    pub flush_meta_bytes: usize,
    pub target_size: usize,
    pub parallel: usize,
    pub min_chunks_per_block: usize,
    /// When positive, parallelism is further capped so each thread gets
    /// at least this many (weighted) input bytes.
    pub min_input_bytes_per_cpu: i64,
    pub max_reads_in_flight: usize,
    pub max_bytes_in_flight: i64,
    pub constants: Vec<(String, OwnedDatum)>,
    pub inputs: Vec<Input>,
    pub prepend: Option<Prepend>,
}

impl Converter {
    pub fn new(algo: &str, align: usize) -> Self {
        Converter {
            algo: algo.to_string(),
            align,
            flush_meta_bytes: align * DEFAULT_FLUSH_CHUNKS,
            target_size: 0,
            parallel: 1,
            min_chunks_per_block: 1,
            min_input_bytes_per_cpu: 0,
            max_reads_in_flight: DEFAULT_MAX_READS,
            max_bytes_in_flight: DEFAULT_MAX_BYTES_IN_FLIGHT,
            constants: Vec::new(),
            inputs: Vec::new(),
            prepend: None,
        }
    }

    /// Effective worker count for this input set.
    pub fn parallel(&self) -> usize {
        let mut p = self.parallel.max(1).min(self.inputs.len().max(1));
        if self.min_input_bytes_per_cpu > 0 {
            let total: i64 = self.inputs.iter().map(|i| i.weighted_size()).sum();
            let min = self.min_input_bytes_per_cpu;
            let cap = ((total + min - 1) / min).max(1);
            p = p.min(cap as usize);
        }
        p
    }

    fn writer_config(&self) -> WriterConfig {
        let mut cfg = WriterConfig::new(&self.algo, self.align)
            .min_chunks(self.min_chunks_per_block)
            .target(self.target_size);
        cfg.skip_checks = false;
        cfg
    }

    /// Convert every input into one packfile on `uploader`. On failure
    /// the first error is returned and the offending input's `err` field
    /// is set; remaining readers are closed.
    pub fn run(&mut self, uploader: Box<dyn Uploader>) -> Result<Trailer> {
        if self.align == 0 || !self.align.is_power_of_two() {
            return Err(Error::Format(format!(
                "alignment {} is not a power of two",
                self.align
            )));
        }
        let p = self.parallel();
        debug!(
            inputs = self.inputs.len(),
            parallel = p,
            algo = %self.algo,
            "starting conversion"
        );
        if p <= 1 {
            self.run_single(uploader)
        } else {
            self.run_multi(uploader, p)
        }
    }

    fn run_single(&mut self, uploader: Box<dyn Uploader>) -> Result<Trailer> {
        let mut w = CompressionWriter::new(uploader, self.writer_config())?;
        for (name, v) in &self.constants {
            w.set_const(name, v.clone());
        }
        let mut skip = 0u64;
        if let Some(p) = self.prepend.as_mut() {
            skip = w.write_start(&mut p.reader, &p.trailer)?;
        }
        let mut chunker = Chunker::new(&mut w, self.align, self.flush_meta_bytes);
        if let Some(mut p) = self.prepend.take() {
            // the open object includes its trailer; only replay the data
            let mut data = (&mut p.reader).take(p.trailer.offset as u64 - skip);
            splice_packfile(&mut data, &p.trailer, skip, &self.algo, &mut chunker)?;
        }

        let inputs = mem::take(&mut self.inputs);
        let total = inputs.len();
        let rx = do_prefetch(inputs, self.max_reads_in_flight, self.max_bytes_in_flight);
        let mut done: Vec<(usize, Input)> = Vec::with_capacity(total);
        let mut failure: Option<Error> = None;
        for (idx, mut input) in rx.iter() {
            if failure.is_some() {
                // drain: close remaining readers without converting
                input.reader = None;
                done.push((idx, input));
                continue;
            }
            let res = match input.err.take() {
                Some(e) => Err(e),
                None => {
                    let r = input.reader.take().expect("reader present");
                    input.format.convert(r, &mut chunker, &self.constants)
                }
            };
            if let Err(e) = res {
                warn!(path = %input.path, error = %e, "input conversion failed");
                failure = Some(e.duplicate());
                input.err = Some(e);
            }
            done.push((idx, input));
        }
        done.sort_by_key(|(i, _)| *i);
        self.inputs = done.into_iter().map(|(_, i)| i).collect();
        if let Some(e) = failure {
            return Err(e);
        }
        chunker.finish()?;
        drop(chunker);
        w.close()
    }

    fn run_multi(&mut self, uploader: Box<dyn Uploader>, p: usize) -> Result<Trailer> {
        let mw = MultiWriter::new(uploader, self.writer_config())?;
        for (name, v) in &self.constants {
            mw.set_const(name, v.clone());
        }
        let mut streams = Vec::with_capacity(p);
        for _ in 0..p {
            streams.push(mw.open()?);
        }

        let inputs = mem::take(&mut self.inputs);
        let total = inputs.len();
        let rx = do_prefetch(inputs, self.max_reads_in_flight, self.max_bytes_in_flight);
        let (msg_tx, msg_rx) = unbounded::<(Option<usize>, Option<Input>, Option<Error>)>();

        let align = self.align;
        let flush_bytes = self.flush_meta_bytes;
        let algo = self.algo.clone();
        let constants = &self.constants;
        let mut prepend = self.prepend.take();

        std::thread::scope(|scope| {
            for stream in streams {
                let rx = rx.clone();
                let msg_tx = msg_tx.clone();
                let prepend = prepend.take();
                let algo = algo.clone();
                scope.spawn(move || {
                    let mut chunker = Chunker::new(stream, align, flush_bytes);
                    if let Some(mut pre) = prepend {
                        let mut data = (&mut pre.reader).take(pre.trailer.offset as u64);
                        if let Err(e) =
                            splice_packfile(&mut data, &pre.trailer, 0, &algo, &mut chunker)
                        {
                            let _ = msg_tx.send((None, None, Some(e)));
                            return;
                        }
                    }
                    for (idx, mut input) in rx.iter() {
                        let res = match input.err.take() {
                            Some(e) => Err(e),
                            None => match input.reader.take() {
                                Some(r) => input.format.convert(r, &mut chunker, constants),
                                None => Ok(()),
                            },
                        };
                        match res {
                            Ok(()) => {
                                let _ = msg_tx.send((Some(idx), Some(input), None));
                            }
                            Err(e) => {
                                input.err = Some(e.duplicate());
                                let _ = msg_tx.send((Some(idx), Some(input), Some(e)));
                                return;
                            }
                        }
                    }
                    let res = match chunker.finish() {
                        Ok(()) => chunker.into_inner().close(),
                        Err(e) => Err(e),
                    };
                    let _ = msg_tx.send((None, None, res.err()));
                });
            }
            drop(msg_tx);

            let mut done: Vec<(usize, Input)> = Vec::with_capacity(total);
            let mut failure: Option<Error> = None;
            let mut finished_workers = 0usize;
            for (idx, input, err) in msg_rx.iter() {
                if let (Some(i), Some(inp)) = (idx, input) {
                    done.push((i, inp));
                } else if err.is_none() {
                    finished_workers += 1;
                }
                if let Some(e) = err {
                    if failure.is_none() {
                        warn!(error = %e, "conversion worker failed");
                        failure = Some(e);
                    }
                    // starve the remaining workers of inputs
                    for (i, mut inp) in rx.try_iter() {
                        inp.reader = None;
                        done.push((i, inp));
                    }
                }
            }
            // any inputs never claimed by a worker; the feeder has no
            // consumers left, so this drains to completion
            for (i, mut inp) in rx.iter() {
                inp.reader = None;
                done.push((i, inp));
            }
            done.sort_by_key(|(i, _)| *i);
            self.inputs = done.into_iter().map(|(_, i)| i).collect();
            if let Some(e) = failure {
                return Err(e);
            }
            debug_assert_eq!(finished_workers, p);
            Ok(())
        })?;

        mw.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_input(path: &str, rows: std::ops::Range<i64>) -> Input {
        let mut body = String::new();
        for i in rows {
            body.push_str(&format!(
                "{{\"ts\": \"2024-03-01T00:00:{:02}Z\", \"n\": {i}}}\n",
                i % 60
            ));
        }
        Input {
            path: path.to_string(),
            etag: format!("etag-{path}"),
            size: body.len() as i64,
            reader: Some(Box::new(std::io::Cursor::new(body.into_bytes()))),
            format: RowFormat::Json { hints: None },
            err: None,
        }
    }

    #[test]
    fn parallel_respects_input_count_and_bytes() {
        let mut c = Converter::new("zstd", 1024);
        c.parallel = 8;
        assert_eq!(c.parallel(), 1); // no inputs
        c.inputs.push(mem_input("a.json", 0..10));
        c.inputs.push(mem_input("b.json", 0..10));
        assert_eq!(c.parallel(), 2);
        c.min_input_bytes_per_cpu = 1 << 30;
        assert_eq!(c.parallel(), 1);
    }

    #[test]
    fn compressed_inputs_weigh_heavier() {
        let mut a = mem_input("a.json", 0..1);
        a.path = "a.json.gz".to_string();
        let w = a.weighted_size();
        let b = mem_input("b.json", 0..1);
        assert_eq!(w, b.weighted_size() * 5);
    }

    #[test]
    fn failing_input_attaches_error() {
        use crate::store_fs::DirFs;
        use crate::store::UploadFs;
        let dir = tempfile::tempdir().unwrap();
        let fs = DirFs::new(dir.path());
        let mut c = Converter::new("zstd", 1024);
        c.inputs.push(mem_input("ok.json", 0..5));
        c.inputs.push(Input {
            path: "bad.json".to_string(),
            etag: String::new(),
            size: 9,
            reader: Some(Box::new(std::io::Cursor::new(b"{broken".to_vec()))),
            format: RowFormat::Json { hints: None },
            err: None,
        });
        let err = c.run(fs.create("out").unwrap()).unwrap_err();
        assert!(err.is_fatal());
        assert!(c.inputs[0].err.is_none());
        assert!(c.inputs[1].err.is_some());
    }
}
