//! The output ring buffer: the hardest piece of this system.
//!
//! Ground truth: `examples/original_source/src/OutputBuffer.{h,cpp}`. The Poco
//! `Mutex` + `Condition` pair there becomes `std::sync::{Mutex, Condvar}`; the
//! `boost::heap::pairing_heap` waiter queue becomes a `BinaryHeap<Reverse<_>>`
//! (ordering by ascending `begin`, matching `ReaderOrdering`'s `left->begin >
//! right->begin` comparator inverted for a max-heap). See also the Condvar-backed
//! ring buffers in the retrieval pack (e.g. `other_examples/.../ring_buffer.rs.rs`)
//! for the general shape of a blocking, position-addressed ring in Rust.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::info;

/// Outcome of a read request against the [`OutputBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// `begin` is the actual position the data starts at (may differ from the
    /// requested position if the requested position had already been overwritten),
    /// and `data` holds the bytes actually read.
    Data { begin: u64, data: Vec<u8> },
    /// The read could not be satisfied before the timeout elapsed.
    Timeout,
    /// The buffer is closed and no more data will ever arrive at or beyond the
    /// requested position.
    Closed,
}

impl ReadResult {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReadResult::Closed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReadResult::Timeout)
    }
}

/// Shared result slot for one blocking read. Cloned into an `Arc` so both the
/// calling thread and a future `write()` call can reach it.
struct Waiter {
    begin: u64,
    count: usize,
    state: Mutex<WaiterState>,
    cond: Condvar,
}

struct WaiterState {
    result: Option<ReadResult>,
    cancelled: bool,
}

impl Waiter {
    fn new(begin: u64, count: usize) -> Arc<Waiter> {
        Arc::new(Waiter {
            begin,
            count,
            state: Mutex::new(WaiterState {
                result: None,
                cancelled: false,
            }),
            cond: Condvar::new(),
        })
    }
}

/// Heap entry ordered so the smallest `begin` sorts first out of a max-heap
/// (`BinaryHeap` is a max-heap, so we reverse the comparison).
struct HeapEntry(Arc<Waiter>);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.begin == other.0.begin
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: a smaller `begin` must compare as "greater" so BinaryHeap's
        // max-heap pops it first.
        other.0.begin.cmp(&self.0.begin)
    }
}

/// Internal mutable state, all guarded by one mutex (the "single mutex protects
/// the entire buffer state and the waiter set" contract from the spec).
struct Inner {
    ring: Vec<u8>,
    max_capacity: usize,
    size: usize,
    head: usize,
    written_bytes: u64,
    closed: bool,
    waiters: BinaryHeap<HeapEntry>,
    waiter_heap_len: usize,
    waiter_active_len: usize,
}

impl Inner {
    fn circular_write(&mut self, data: &[u8]) {
        let capacity = self.max_capacity;
        let room = capacity - self.size;
        let bytes_to_write = data.len().min(room);
        let tail = (self.head + self.size) % capacity;
        let right_size = capacity - tail;

        if bytes_to_write <= right_size {
            self.ring[tail..tail + bytes_to_write].copy_from_slice(&data[..bytes_to_write]);
        } else {
            self.ring[tail..capacity].copy_from_slice(&data[..right_size]);
            self.ring[..bytes_to_write - right_size]
                .copy_from_slice(&data[right_size..bytes_to_write]);
        }
        self.size += bytes_to_write;
    }

    /// Writes `data`, sliding the window forward when there isn't room, and
    /// advances `written_bytes`. Returns nothing observable; matches `_overwrite`.
    fn overwrite(&mut self, data: &[u8]) {
        let capacity = self.max_capacity;
        let count = data.len();

        if count >= capacity {
            self.size = 0;
            self.head = 0;
            self.circular_write(&data[count - capacity..]);
        } else {
            let preserve_len = capacity - count;
            if preserve_len < self.size {
                let overwritten_len = self.size - preserve_len;
                self.size -= overwritten_len;
                self.head = (self.head + overwritten_len) % capacity;
            }
            self.circular_write(data);
        }

        self.written_bytes += count as u64;
    }

    /// Copies up to `count` bytes starting at ring-relative offset `start` into a
    /// freshly allocated `Vec`. Matches `_circularRead`.
    fn circular_read(&self, start: usize, count: usize) -> Vec<u8> {
        if self.size <= start {
            return Vec::new();
        }
        let read_size = count.min(self.size - start);
        let mut out = vec![0u8; read_size];
        let front = (self.head + start) % self.max_capacity;
        let right_size = self.max_capacity - front;

        if read_size <= right_size {
            out.copy_from_slice(&self.ring[front..front + read_size]);
        } else {
            out[..right_size].copy_from_slice(&self.ring[front..self.max_capacity]);
            out[right_size..].copy_from_slice(&self.ring[..read_size - right_size]);
        }
        out
    }

    fn translate_negative_begin(&self, begin: i64) -> u64 {
        let mut begin = begin;
        if begin < 0 {
            begin += self.written_bytes as i64;
        }
        if begin < 0 {
            begin = 0;
        }
        begin as u64
    }

    /// Non-blocking attempt. Matches `_tryRead`.
    fn try_read_locked(&self, begin: u64, count: usize) -> ReadResult {
        if begin < self.written_bytes {
            let min_begin = self.written_bytes - self.size as u64;
            let local_start = if begin <= min_begin {
                0
            } else {
                (begin - min_begin) as usize
            };
            let actual_begin = self.written_bytes - self.size as u64 + local_start as u64;
            ReadResult::Data {
                begin: actual_begin,
                data: self.circular_read(local_start, count),
            }
        } else if self.closed {
            ReadResult::Closed
        } else {
            ReadResult::Timeout
        }
    }

    /// Wakes every waiter whose `begin` is now satisfiable, in ascending `begin`
    /// order, copying bytes directly out of `data` (the bytes just written) rather
    /// than re-reading the ring, since an overwrite in the same call may already
    /// have evicted them. Matches `ReaderList::process` + the lambda in `write()`.
    fn wake_waiters(&mut self, old_written: u64, data: &[u8]) {
        while let Some(top) = self.waiters.peek() {
            if top.0.begin >= self.written_bytes {
                break;
            }
            let HeapEntry(waiter) = self.waiters.pop().expect("just peeked");
            self.waiter_heap_len -= 1;

            let mut state = waiter.state.lock().expect("waiter mutex poisoned");
            if !state.cancelled {
                debug_assert!(waiter.begin >= old_written);
                let item_count =
                    waiter.count.min((self.written_bytes - waiter.begin) as usize);
                let offset = (waiter.begin - old_written) as usize;
                let payload = data[offset..offset + item_count].to_vec();
                state.result = Some(ReadResult::Data {
                    begin: waiter.begin,
                    data: payload,
                });
                self.waiter_active_len -= 1;
                drop(state);
                waiter.cond.notify_one();
            }
        }
    }

    fn close_locked(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        while let Some(HeapEntry(waiter)) = self.waiters.pop() {
            let mut state = waiter.state.lock().expect("waiter mutex poisoned");
            state.result = Some(ReadResult::Closed);
            drop(state);
            waiter.cond.notify_one();
        }
        self.waiter_heap_len = 0;
        self.waiter_active_len = 0;
    }

    fn maybe_compact(&mut self) {
        if self.waiter_active_len * 8 < self.waiter_heap_len && self.waiter_heap_len > 1000 {
            let old_heap_len = self.waiter_heap_len;
            let mut fresh = BinaryHeap::with_capacity(self.waiter_active_len);
            for entry in self.waiters.drain() {
                let cancelled = entry.0.state.lock().expect("waiter mutex poisoned").cancelled;
                if !cancelled {
                    fresh.push(entry);
                }
            }
            self.waiters = fresh;
            self.waiter_heap_len = self.waiter_active_len;
            info!(
                "Waiting queue for output buffer readers has been re-allocated ({} -> {}).",
                old_heap_len, self.waiter_heap_len
            );
        }
    }
}

/// Byte-position-addressed circular buffer with blocking and non-blocking reads.
///
/// See module docs for the grounding source. `max_capacity` bytes are allocated up
/// front; the historical "capacity doubling" from the original is not observable
/// (per spec.md §4.1) and is not reproduced.
pub struct OutputBuffer {
    inner: Mutex<Inner>,
}

impl OutputBuffer {
    /// `initial_capacity` is accepted for interface parity with the original but has
    /// no observable effect, matching spec.md §4.1.
    pub fn new(max_capacity: usize, _initial_capacity: usize) -> Self {
        assert!(max_capacity > 0, "max_capacity must be positive");
        OutputBuffer {
            inner: Mutex::new(Inner {
                ring: vec![0u8; max_capacity],
                max_capacity,
                size: 0,
                head: 0,
                written_bytes: 0,
                closed: false,
                waiters: BinaryHeap::new(),
                waiter_heap_len: 0,
                waiter_active_len: 0,
            }),
        }
    }

    pub fn with_default_initial(max_capacity: usize) -> Self {
        Self::new(max_capacity, max_capacity.min(64 * 1024))
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("buffer mutex poisoned").size
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("buffer mutex poisoned").max_capacity
    }

    pub fn written_bytes(&self) -> u64 {
        self.inner
            .lock()
            .expect("buffer mutex poisoned")
            .written_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("buffer mutex poisoned").closed
    }

    /// Appends `data`, sliding the window and waking satisfied waiters.
    pub fn write(&self, data: &[u8]) -> Result<(), crate::error::SupervisorError> {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        if inner.closed {
            return Err(crate::error::SupervisorError::BufferClosed);
        }
        let old_written = inner.written_bytes;
        inner.overwrite(data);
        inner.wake_waiters(old_written, data);
        Ok(())
    }

    /// Blocking read. `begin` may be negative (relative to `written_bytes`).
    /// `timeout` of `None` waits forever.
    pub fn read(&self, begin: i64, count: usize, timeout: Option<Duration>) -> ReadResult {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        let positive_begin = inner.translate_negative_begin(begin);
        let result = inner.try_read_locked(positive_begin, count);
        if !result.is_timeout() {
            return result;
        }

        let waiter = Waiter::new(positive_begin, count);
        inner.waiters.push(HeapEntry(waiter.clone()));
        inner.waiter_heap_len += 1;
        inner.waiter_active_len += 1;

        let mut state = waiter.state.lock().expect("waiter mutex poisoned");
        // Release the buffer lock while we wait on the per-waiter condvar; the
        // writer only needs the buffer lock to enqueue/wake, never ours.
        drop(inner);

        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            match deadline {
                None => {
                    state = waiter.cond.wait(state).expect("waiter mutex poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.cancel_waiter_and_timeout(&waiter, state);
                    }
                    let (new_state, timeout_result) = waiter
                        .cond
                        .wait_timeout(state, deadline - now)
                        .expect("waiter mutex poisoned");
                    state = new_state;
                    if timeout_result.timed_out() && state.result.is_none() {
                        return self.cancel_waiter_and_timeout(&waiter, state);
                    }
                }
            }
        }
    }

    /// Cancels a timed-out waiter and reports `Timeout`, unless `write()` already
    /// satisfied it in the gap between the caller's deadline check and this call.
    ///
    /// `write()`'s `wake_waiters` locks `inner` then the waiter's own state (to
    /// notify it) while holding `inner` the whole time. A caller here already
    /// holds the waiter's state lock, so it must drop it and re-acquire `inner`
    /// before `state`, matching that same inner-then-state order; locking `inner`
    /// while still holding `state` would invert the order against a concurrent
    /// `write()` and deadlock.
    fn cancel_waiter_and_timeout(&self, waiter: &Arc<Waiter>, state: MutexGuard<'_, WaiterState>) -> ReadResult {
        drop(state);
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        let mut state = waiter.state.lock().expect("waiter mutex poisoned");
        if let Some(result) = state.result.take() {
            return result;
        }
        state.cancelled = true;
        drop(state);
        inner.waiter_active_len = inner.waiter_active_len.saturating_sub(1);
        inner.maybe_compact();
        ReadResult::Timeout
    }

    /// Never blocks; returns `Timeout` instead of enqueuing a waiter.
    pub fn try_read(&self, begin: i64, count: usize) -> ReadResult {
        let inner = self.inner.lock().expect("buffer mutex poisoned");
        let positive_begin = inner.translate_negative_begin(begin);
        inner.try_read_locked(positive_begin, count)
    }

    /// Idempotent. Wakes every pending waiter with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        inner.close_locked();
    }
}
