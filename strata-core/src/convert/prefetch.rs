//! Bounded launch-ahead for input readers: a feeder thread kicks each
//! reader (zero-byte read) and forwards it through a bounded channel so
//! backing-store latency overlaps with convert work. Total bytes in
//! flight are capped by an atomic counter updated with a compare-exchange
//! loop; a reader's share is released when it is dropped.

use std::io::Read;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};

use super::Input;

/// Reader wrapper that releases its inflight charge on drop.
pub struct TrackedReader {
    inner: Box<dyn Read + Send>,
    size: i64,
    counter: Arc<AtomicI64>,
}

impl Read for TrackedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.size, Ordering::AcqRel);
    }
}

fn charge(counter: &AtomicI64, size: i64, want: i64) {
    loop {
        let cur = counter.load(Ordering::Acquire);
        if cur == 0 || cur + size <= want {
            if counter
                .compare_exchange(cur, cur + size, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        } else {
            std::thread::yield_now();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Forward `inputs` through a bounded channel, at most `max_reads` queued
/// and at most `want_inflight` bytes charged at once (a single oversized
/// input is always admitted). Dropping the receiver cancels the feeder;
/// unsent readers are closed by drop.
pub fn do_prefetch(
    inputs: Vec<Input>,
    max_reads: usize,
    want_inflight: i64,
) -> Receiver<(usize, Input)> {
    let (tx, rx) = bounded(max_reads.max(1));
    std::thread::spawn(move || {
        let counter = Arc::new(AtomicI64::new(0));
        for (idx, mut input) in inputs.into_iter().enumerate() {
            if let Some(mut r) = input.reader.take() {
                let size = input.size.max(0);
                charge(&counter, size, want_inflight);
                // zero-byte read: lazy readers start their fetch here
                if let Err(e) = r.read(&mut []) {
                    input.err = Some(e.into());
                }
                input.reader = Some(Box::new(TrackedReader {
                    inner: r,
                    size,
                    counter: Arc::clone(&counter),
                }));
            }
            if tx.send((idx, input)).is_err() {
                // receiver is gone: cancellation; remaining readers are
                // closed as this loop's inputs drop
                return;
            }
        }
    });
    rx
}
