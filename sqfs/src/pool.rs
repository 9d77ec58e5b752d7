//! The block-compression worker pool.
//!
//! Every submitted payload gets a monotonically increasing sequence
//! number. Workers compress payloads in whatever order the scheduler
//! runs them; finished items park in a min-heap keyed by that sequence
//! number, and the producer pops the heap only while its head carries
//! the next number to emit. The caller therefore sees completions in
//! exactly the submission order, which keeps block offsets
//! deterministic.
//!
//! Submission waits once `max_backlog` items are in flight; that single
//! bound also caps both channels and the heap, so no worker can ever
//! stall on a full channel.

use std::collections::BinaryHeap;
use std::num::NonZero;
use std::{panic, thread};

use crossbeam_channel as channel;

use crate::{ErrorInner, Result, compress::Compressor};

/// One compressed (or intentionally raw) payload.
#[derive(Debug)]
pub(crate) struct Block {
    pub data: Vec<u8>,
    pub compressed: bool,
}

#[derive(Debug)]
struct WorkItem<T> {
    seq: u64,
    tag: T,
    raw: Vec<u8>,
}

/// A finished item, parked until its sequence number comes up.
#[derive(Debug)]
struct DoneItem<T> {
    seq: u64,
    tag: T,
    ret: Result<Block>,
}

impl<T> PartialEq for DoneItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for DoneItem<T> {}

impl<T> PartialOrd for DoneItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DoneItem<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: `BinaryHeap` is a max-heap, the pool wants the
        // smallest outstanding sequence number on top.
        other.seq.cmp(&self.seq)
    }
}

/// Compression workers plus the reordering state. `T` is an opaque tag
/// the caller uses to route finished blocks (file block vs fragment).
#[derive(Debug)]
pub(crate) struct CompressPool<T> {
    queue: Option<channel::Sender<WorkItem<T>>>,
    completed: channel::Receiver<DoneItem<T>>,
    parked: BinaryHeap<DoneItem<T>>,
    next_seq: u64,
    next_emit: u64,
    max_backlog: usize,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<T> Drop for CompressPool<T> {
    fn drop(&mut self) {
        self.queue = None;
        for handle in self.workers.drain(..) {
            // A panicking worker already reported itself as an error
            // item before the unwind was caught.
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> CompressPool<T> {
    /// Spawn `workers` threads, each owning its own clone of `cmp`.
    pub(crate) fn new(
        cmp: &Compressor,
        workers: NonZero<usize>,
        max_backlog: NonZero<usize>,
    ) -> std::io::Result<Self> {
        let (queue_tx, queue_rx) = channel::bounded(max_backlog.get());
        let (completed_tx, completed_rx) = channel::bounded(max_backlog.get());

        let workers = (0..workers.get())
            .map(|idx| {
                let cmp = cmp.clone();
                let queue_rx = queue_rx.clone();
                let completed_tx = completed_tx.clone();
                thread::Builder::new()
                    .name(format!("sqfs-blk-{idx}"))
                    .spawn(move || worker(cmp, queue_rx, completed_tx))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            queue: Some(queue_tx),
            completed: completed_rx,
            parked: BinaryHeap::new(),
            next_seq: 0,
            next_emit: 0,
            max_backlog: max_backlog.get(),
            workers,
        })
    }

    /// Items submitted but not yet handed back.
    fn in_flight(&self) -> usize {
        (self.next_seq - self.next_emit) as usize
    }

    /// Queue one payload for compression.
    ///
    /// Waits while `max_backlog` items are in flight; that wait is the
    /// producer backpressure. Completions that became emittable,
    /// including any collected during the wait, are appended to `out`
    /// in sequence order.
    pub(crate) fn submit(
        &mut self,
        tag: T,
        raw: Vec<u8>,
        out: &mut Vec<(T, Result<Block>)>,
    ) -> Result<()> {
        while self.in_flight() >= self.max_backlog {
            self.park_one()?;
            self.pop_ready(out);
        }

        let queue = self
            .queue
            .as_ref()
            .ok_or(ErrorInner::Internal("compression pool is closed"))?;
        let item = WorkItem {
            seq: self.next_seq,
            tag,
            raw,
        };
        // Queued items never exceed the in-flight bound, so the
        // bounded channel cannot be full here.
        queue
            .send(item)
            .map_err(|_| ErrorInner::Internal("compression workers are gone"))?;
        self.next_seq += 1;

        while let Ok(done) = self.completed.try_recv() {
            self.parked.push(done);
        }
        self.pop_ready(out);
        Ok(())
    }

    /// Wait for every in-flight item and append all of them to `out` in
    /// sequence order.
    pub(crate) fn drain(&mut self, out: &mut Vec<(T, Result<Block>)>) -> Result<()> {
        while self.next_emit < self.next_seq {
            self.park_one()?;
            self.pop_ready(out);
        }
        Ok(())
    }

    /// Stop accepting work. Workers exit at their next queue poll;
    /// items already queued still complete and can be drained.
    pub(crate) fn close(&mut self) {
        self.queue = None;
    }

    fn park_one(&mut self) -> Result<()> {
        let done = self
            .completed
            .recv()
            .map_err(|_| ErrorInner::Internal("compression workers are gone"))?;
        self.parked.push(done);
        Ok(())
    }

    fn pop_ready(&mut self, out: &mut Vec<(T, Result<Block>)>) {
        while self
            .parked
            .peek()
            .is_some_and(|done| done.seq == self.next_emit)
        {
            let done = self.parked.pop().expect("peeked above");
            self.next_emit += 1;
            out.push((done.tag, done.ret));
        }
    }
}

fn worker<T>(
    cmp: Compressor,
    queue: channel::Receiver<WorkItem<T>>,
    completed: channel::Sender<DoneItem<T>>,
) {
    while let Ok(WorkItem { seq, tag, raw }) = queue.recv() {
        let ret = panic::catch_unwind(panic::AssertUnwindSafe(|| compress_one(&cmp, raw)))
            .unwrap_or_else(|_| Err(ErrorInner::Internal("compression worker panicked").into()));
        if completed.send(DoneItem { seq, tag, ret }).is_err() {
            break;
        }
    }
}

fn compress_one(cmp: &Compressor, raw: Vec<u8>) -> Result<Block> {
    Ok(match cmp.compress(&raw)? {
        Some(data) => Block {
            data,
            compressed: true,
        },
        None => Block {
            data: raw,
            compressed: false,
        },
    })
}
