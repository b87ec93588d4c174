//! Generic segmented-stream pipeline.
//!
//! Three coordinating threads per opened stream:
//!
//! - the **worker** runs a [`SegmentProducer`] which owns the live-edge and
//!   reload clock and yields segments in playback order;
//! - a pool of **fetchers** downloads segments concurrently through a
//!   [`SegmentFetcher`], streaming pieces into per-segment channels;
//! - the **writer** drains those channels strictly in the order the worker
//!   queued them, so bytes reach the ring buffer in playback order no matter
//!   which fetch finishes first.
//!
//! The reader side is [`SegmentedHandle`]: a blocking `Read` over the ring
//! buffer that propagates writer-side errors and honors the filtered-segment
//! pause.

use std::{
    io,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use tracing::{debug, error, trace, warn};

use crate::{buffer::RingBuffer, common::PipeResult, stream::StreamHandle};

/// Consecutive dropped segments after which the stream is declared dead.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Synchronous cancellation signal shared by all pipeline threads.
#[derive(Clone)]
pub struct CloseSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn close(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep up to `duration`, waking early on close. Returns true when the
    /// signal fired.
    pub fn wait(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut closed = lock.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + duration;
        while !*closed {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(closed, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            closed = guard;
        }
        true
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One piece of a fetched segment, streamed from a fetcher to the writer.
pub enum Piece {
    Data(Vec<u8>),
    /// The segment was intentionally discarded (ad filter, name filter);
    /// the reader pauses until real data follows.
    Filtered,
    /// Fetch failed after all retries; the segment is dropped.
    Failed(String),
}

/// Sink handed to a fetcher for one segment.
pub struct SegmentSink {
    tx: flume::Sender<Piece>,
}

impl SegmentSink {
    /// Returns false when the pipeline has gone away and fetching should
    /// stop.
    pub fn write(&self, data: Vec<u8>) -> bool {
        self.tx.send(Piece::Data(data)).is_ok()
    }

    pub fn filtered(&self) {
        let _ = self.tx.send(Piece::Filtered);
    }

    pub fn failed(&self, message: String) {
        let _ = self.tx.send(Piece::Failed(message));
    }
}

/// Yields segments in playback order. Owns the reload/live-edge clock; any
/// waiting must go through the [`CloseSignal`] so `close()` interrupts it.
pub trait SegmentProducer: Send + 'static {
    type Segment: Send + 'static;

    fn next(&mut self, closer: &CloseSignal) -> Option<Self::Segment>;
}

/// Downloads one segment, writing decoded bytes into the sink. Shared by all
/// fetch threads; per-stream mutable state (key caches etc.) lives behind
/// interior mutability.
pub trait SegmentFetcher: Send + Sync + 'static {
    type Segment: Send + 'static;

    fn fetch(&self, segment: Self::Segment, sink: &SegmentSink, closer: &CloseSignal);
}

pub struct SegmentedOptions {
    pub threads: usize,
    pub ringbuffer_size: usize,
    pub read_timeout: Duration,
    pub name: String,
}

impl Default for SegmentedOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            ringbuffer_size: 16 * 1024 * 1024,
            read_timeout: Duration::from_secs(60),
            name: "segmented".into(),
        }
    }
}

/// Writer-side state shared with the reader.
struct SharedState {
    error: Mutex<Option<String>>,
    pause: Mutex<bool>,
    pause_cvar: Condvar,
}

pub struct SegmentedHandle {
    buffer: Arc<RingBuffer>,
    shared: Arc<SharedState>,
    closer: CloseSignal,
    read_timeout: Duration,
}

impl SegmentedHandle {
    /// Spawn the worker, fetcher pool and writer for a producer/fetcher pair
    /// and return the reader handle.
    pub fn spawn<P, F>(mut producer: P, fetcher: Arc<F>, opts: SegmentedOptions) -> PipeResult<Self>
    where
        P: SegmentProducer,
        F: SegmentFetcher<Segment = P::Segment>,
    {
        let threads = opts.threads.max(1);
        let buffer = Arc::new(RingBuffer::new(opts.ringbuffer_size));
        let closer = CloseSignal::new();
        let shared = Arc::new(SharedState {
            error: Mutex::new(None),
            pause: Mutex::new(false),
            pause_cvar: Condvar::new(),
        });

        // Jobs flow worker -> pool; the ordered queue of per-segment piece
        // receivers flows worker -> writer. Queuing the receiver before the
        // job keeps the writer's order identical to production order.
        type Job<S> = (S, SegmentSink);
        let (job_tx, job_rx) = flume::bounded::<Job<P::Segment>>(threads);
        let (ord_tx, ord_rx) = flume::bounded::<flume::Receiver<Piece>>(threads + 1);

        let worker_closer = closer.clone();
        thread::Builder::new()
            .name(format!("{}-worker", opts.name))
            .spawn(move || {
                while let Some(segment) = producer.next(&worker_closer) {
                    let (piece_tx, piece_rx) = flume::bounded::<Piece>(16);
                    if ord_tx.send(piece_rx).is_err() {
                        break;
                    }
                    if job_tx.send((segment, SegmentSink { tx: piece_tx })).is_err() {
                        break;
                    }
                }
                trace!("Worker finished");
            })
            .map_err(|e| crate::common::PipeError::stream(format!("Failed to spawn worker: {e}")))?;

        for i in 0..threads {
            let job_rx = job_rx.clone();
            let fetcher = fetcher.clone();
            let fetch_closer = closer.clone();
            thread::Builder::new()
                .name(format!("{}-fetch-{i}", opts.name))
                .spawn(move || {
                    while let Ok((segment, sink)) = job_rx.recv() {
                        if fetch_closer.is_closed() {
                            break;
                        }
                        fetcher.fetch(segment, &sink, &fetch_closer);
                    }
                })
                .map_err(|e| {
                    crate::common::PipeError::stream(format!("Failed to spawn fetcher: {e}"))
                })?;
        }

        let writer_buffer = buffer.clone();
        let writer_shared = shared.clone();
        let writer_closer = closer.clone();
        thread::Builder::new()
            .name(format!("{}-writer", opts.name))
            .spawn(move || {
                let mut consecutive_failures = 0u32;
                'outer: while let Ok(piece_rx) = ord_rx.recv() {
                    let mut wrote_data = false;
                    while let Ok(piece) = piece_rx.recv() {
                        match piece {
                            Piece::Data(data) => {
                                wrote_data = true;
                                {
                                    let mut paused = writer_shared
                                        .pause
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner());
                                    if *paused {
                                        debug!("Resuming reader after filtered sequence");
                                        *paused = false;
                                        writer_shared.pause_cvar.notify_all();
                                    }
                                }
                                let n = writer_buffer.write(&data);
                                if n < data.len() {
                                    // Buffer closed underneath us.
                                    break 'outer;
                                }
                            }
                            Piece::Filtered => {
                                let mut paused = writer_shared
                                    .pause
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner());
                                if !*paused {
                                    debug!("Filtered segment, pausing reader");
                                    *paused = true;
                                }
                            }
                            Piece::Failed(message) => {
                                error!("Failed to fetch segment: {message}");
                                consecutive_failures += 1;
                                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                                    *writer_shared
                                        .error
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner()) = Some(message);
                                    break 'outer;
                                }
                            }
                        }
                    }
                    if wrote_data {
                        consecutive_failures = 0;
                    }
                    if writer_closer.is_closed() {
                        break;
                    }
                }
                // Unblock a paused reader so it can observe EOF/error.
                {
                    let mut paused =
                        writer_shared.pause.lock().unwrap_or_else(|e| e.into_inner());
                    *paused = false;
                    writer_shared.pause_cvar.notify_all();
                }
                writer_buffer.close();
                trace!("Writer finished");
            })
            .map_err(|e| crate::common::PipeError::stream(format!("Failed to spawn writer: {e}")))?;

        Ok(Self {
            buffer,
            shared,
            closer,
            read_timeout: opts.read_timeout,
        })
    }

    fn take_error(&self) -> Option<String> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Wait out a filtered-sequence pause. Returns false when the buffer
    /// closed while paused.
    fn wait_unpaused(&self) {
        let mut paused = self.shared.pause.lock().unwrap_or_else(|e| e.into_inner());
        while *paused && !self.buffer.is_closed() {
            let (guard, _) = self
                .shared
                .pause_cvar
                .wait_timeout(paused, Duration::from_millis(250))
                .unwrap_or_else(|e| e.into_inner());
            paused = guard;
        }
    }
}

impl io::Read for SegmentedHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.take_error() {
            self.buffer.close();
            return Err(io::Error::other(err));
        }
        self.wait_unpaused();
        match self.buffer.read(buf.len(), true, Some(self.read_timeout)) {
            Ok(data) => {
                if data.is_empty() {
                    // EOF; surface a writer-side error that raced the close.
                    if let Some(err) = self.take_error() {
                        return Err(io::Error::other(err));
                    }
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Read timeout, stream stalled",
            )),
        }
    }
}

impl StreamHandle for SegmentedHandle {
    fn close(&mut self) {
        self.closer.close();
        self.buffer.close();
    }
}

impl Drop for SegmentedHandle {
    fn drop(&mut self) {
        self.closer.close();
        self.buffer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct CountingProducer {
        count: u64,
        limit: u64,
    }

    impl SegmentProducer for CountingProducer {
        type Segment = u64;

        fn next(&mut self, closer: &CloseSignal) -> Option<u64> {
            if closer.is_closed() || self.count >= self.limit {
                return None;
            }
            self.count += 1;
            Some(self.count - 1)
        }
    }

    /// Writes each segment number as a one-byte payload, with a delay
    /// inversely proportional to the number so later segments finish first.
    struct ReorderingFetcher;

    impl SegmentFetcher for ReorderingFetcher {
        type Segment = u64;

        fn fetch(&self, segment: u64, sink: &SegmentSink, _closer: &CloseSignal) {
            let delay = 50u64.saturating_sub(segment * 10);
            thread::sleep(Duration::from_millis(delay));
            sink.write(vec![segment as u8]);
        }
    }

    #[test]
    fn bytes_arrive_in_production_order_despite_pool() {
        let handle = SegmentedHandle::spawn(
            CountingProducer { count: 0, limit: 5 },
            Arc::new(ReorderingFetcher),
            SegmentedOptions {
                threads: 4,
                ringbuffer_size: 64,
                ..Default::default()
            },
        )
        .unwrap();
        let mut handle = handle;
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    struct FilteringFetcher;

    impl SegmentFetcher for FilteringFetcher {
        type Segment = u64;

        fn fetch(&self, segment: u64, sink: &SegmentSink, _closer: &CloseSignal) {
            if segment % 2 == 1 {
                sink.filtered();
            } else {
                sink.write(vec![segment as u8]);
            }
        }
    }

    #[test]
    fn filtered_segments_leave_no_gap_in_output() {
        let mut handle = SegmentedHandle::spawn(
            CountingProducer { count: 0, limit: 6 },
            Arc::new(FilteringFetcher),
            SegmentedOptions {
                threads: 2,
                ringbuffer_size: 64,
                ..Default::default()
            },
        )
        .unwrap();
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0, 2, 4]);
    }

    struct FailingFetcher;

    impl SegmentFetcher for FailingFetcher {
        type Segment = u64;

        fn fetch(&self, segment: u64, sink: &SegmentSink, _closer: &CloseSignal) {
            if segment == 1 {
                sink.failed("boom".into());
            } else {
                sink.write(vec![segment as u8]);
            }
        }
    }

    #[test]
    fn single_dropped_segment_does_not_kill_stream() {
        let mut handle = SegmentedHandle::spawn(
            CountingProducer { count: 0, limit: 4 },
            Arc::new(FailingFetcher),
            SegmentedOptions::default(),
        )
        .unwrap();
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0, 2, 3]);
    }

    struct AlwaysFailingFetcher;

    impl SegmentFetcher for AlwaysFailingFetcher {
        type Segment = u64;

        fn fetch(&self, _segment: u64, sink: &SegmentSink, _closer: &CloseSignal) {
            sink.failed("persistent".into());
        }
    }

    #[test]
    fn persistent_failure_surfaces_on_read() {
        let mut handle = SegmentedHandle::spawn(
            CountingProducer { count: 0, limit: 10 },
            Arc::new(AlwaysFailingFetcher),
            SegmentedOptions::default(),
        )
        .unwrap();
        let mut out = Vec::new();
        assert!(handle.read_to_end(&mut out).is_err());
    }

    struct BlockingProducer;

    impl SegmentProducer for BlockingProducer {
        type Segment = u64;

        fn next(&mut self, closer: &CloseSignal) -> Option<u64> {
            // Simulates a live reload wait; must be interruptible.
            if closer.wait(Duration::from_secs(60)) {
                return None;
            }
            Some(0)
        }
    }

    #[test]
    fn close_interrupts_waiting_worker() {
        let mut handle = SegmentedHandle::spawn(
            BlockingProducer,
            Arc::new(ReorderingFetcher),
            SegmentedOptions::default(),
        )
        .unwrap();
        let start = std::time::Instant::now();
        handle.close();
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
