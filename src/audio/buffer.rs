//! Thread-safe byte ring buffer with jitter compensation.
//!
//! The producer never blocks: when a write would exceed capacity the oldest
//! bytes are discarded and the overrun counter bumps by one. Readers block
//! up to a timeout and may return fewer bytes than requested, which the
//! playback loops rely on to keep cadence under network jitter.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::{BufferPolicy, StreamConfig, StreamFormat};

/// Overrun/underrun warnings are compressed to one summary per window.
const EVENT_WINDOW: Duration = Duration::from_secs(60);
/// Minimum events in a window before a summary is worth emitting.
const EVENT_THRESHOLD: u32 = 10;

/// Tracks a recurring event stream and decides which occurrences to log:
/// the first one immediately, then at most one summary per window when the
/// window saw at least [`EVENT_THRESHOLD`] events.
#[derive(Debug)]
struct RateLimited {
    window_start: Option<Instant>,
    window_count: u32,
}

enum Emit {
    First,
    Summary(u32),
    Quiet,
}

impl RateLimited {
    fn new() -> Self {
        Self {
            window_start: None,
            window_count: 0,
        }
    }

    fn record(&mut self) -> Emit {
        let now = Instant::now();
        match self.window_start {
            None => {
                self.window_start = Some(now);
                self.window_count = 0;
                Emit::First
            }
            Some(start) => {
                self.window_count += 1;
                if now.duration_since(start) >= EVENT_WINDOW {
                    let count = self.window_count;
                    self.window_start = Some(now);
                    self.window_count = 0;
                    if count >= EVENT_THRESHOLD {
                        Emit::Summary(count)
                    } else {
                        Emit::Quiet
                    }
                } else {
                    Emit::Quiet
                }
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    buf: Box<[u8]>,
    write_pos: usize,
    read_pos: usize,
    available: usize,
    closed: bool,

    total_bytes_written: u64,
    total_bytes_read: u64,
    underrun_count: u32,
    overrun_count: u32,
    overrun_events: RateLimited,
    underrun_events: RateLimited,
}

/// Counter snapshot, see [`RingBuffer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
    pub underrun_count: u32,
    pub overrun_count: u32,
}

/// Circular byte buffer guarded by one mutex and two condition variables.
///
/// Any number of producers and consumers may use it concurrently; the
/// typical topology is one of each. The buffer is reused across reconnects
/// via [`clear`](RingBuffer::clear).
pub struct RingBuffer {
    label: &'static str,
    capacity: usize,
    format: StreamFormat,
    policy: BufferPolicy,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl RingBuffer {
    /// Creates a buffer sized at twice the policy's max level.
    pub fn new(config: &StreamConfig, label: &'static str) -> Self {
        let capacity = config.format.ms_to_bytes(config.policy.max_ms as u64 * 2);
        Self::with_capacity(config, capacity, label)
    }

    /// Creates a buffer with an explicit byte capacity.
    pub fn with_capacity(config: &StreamConfig, capacity: usize, label: &'static str) -> Self {
        Self {
            label,
            capacity,
            format: config.format,
            policy: config.policy,
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
                available: 0,
                closed: false,
                total_bytes_written: 0,
                total_bytes_read: 0,
                underrun_count: 0,
                overrun_count: 0,
                overrun_events: RateLimited::new(),
                underrun_events: RateLimited::new(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Writes `data` into the buffer, never blocking.
    ///
    /// If the buffer cannot hold `data` on top of what is already buffered,
    /// the oldest bytes are dropped first (one overrun event regardless of
    /// how many bytes were dropped). Always accepts the full slice and
    /// returns its length.
    pub fn write(&self, data: &[u8]) -> usize {
        let len = data.len();
        if len == 0 {
            return 0;
        }

        let mut inner = self.inner.lock().unwrap();

        if inner.available + len > self.capacity {
            match inner.overrun_events.record() {
                Emit::First => warn!("{}: buffer overrun, dropping oldest audio", self.label),
                Emit::Summary(n) => {
                    warn!("{}: {} buffer overruns in the last minute", self.label, n)
                }
                Emit::Quiet => {}
            }
            inner.overrun_count += 1;

            if len >= self.capacity {
                // The write alone fills the whole buffer; keep only its tail.
                let tail = &data[len - self.capacity..];
                inner.buf.copy_from_slice(tail);
                inner.read_pos = 0;
                inner.write_pos = 0;
                inner.available = self.capacity;
                inner.total_bytes_written += len as u64;
                self.not_empty.notify_all();
                return len;
            }

            let drop = inner.available + len - self.capacity;
            inner.read_pos = (inner.read_pos + drop) % self.capacity;
            inner.available -= drop;
        }

        let mut written = 0;
        while written < len {
            let space_to_end = self.capacity - inner.write_pos;
            let chunk = (len - written).min(space_to_end);
            let pos = inner.write_pos;
            inner.buf[pos..pos + chunk].copy_from_slice(&data[written..written + chunk]);
            inner.write_pos = (inner.write_pos + chunk) % self.capacity;
            written += chunk;
            inner.available += chunk;
        }

        inner.total_bytes_written += len as u64;
        self.not_empty.notify_all();
        len
    }

    /// Reads up to `out.len()` bytes.
    ///
    /// If the buffer is empty, waits up to `timeout` for data
    /// (`Duration::ZERO` means return immediately). Once any data is
    /// present the call returns whatever is available without waiting for
    /// the full request; partial reads are part of the contract.
    ///
    /// Returns the number of bytes read, `0` on timeout with no data, or
    /// `-1` once the buffer has been [`close`](RingBuffer::close)d.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> isize {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return -1;
        }

        if inner.available == 0 {
            if timeout.is_zero() {
                return 0;
            }
            let deadline = Instant::now() + timeout;
            while inner.available == 0 && !inner.closed {
                let now = Instant::now();
                if now >= deadline {
                    inner.underrun_count += 1;
                    match inner.underrun_events.record() {
                        Emit::First => warn!("{}: buffer underrun", self.label),
                        Emit::Summary(n) => {
                            warn!("{}: {} buffer underruns in the last minute", self.label, n)
                        }
                        Emit::Quiet => {}
                    }
                    return 0;
                }
                let (guard, _) = self
                    .not_empty
                    .wait_timeout(inner, deadline - now)
                    .unwrap();
                inner = guard;
            }
            if inner.closed {
                return -1;
            }
        }

        let to_read = out.len().min(inner.available);
        let mut read = 0;
        while read < to_read {
            let data_to_end = self.capacity - inner.read_pos;
            let chunk = (to_read - read).min(data_to_end);
            let pos = inner.read_pos;
            out[read..read + chunk].copy_from_slice(&inner.buf[pos..pos + chunk]);
            inner.read_pos = (inner.read_pos + chunk) % self.capacity;
            read += chunk;
            inner.available -= chunk;
        }

        inner.total_bytes_read += to_read as u64;
        self.not_full.notify_all();
        to_read as isize
    }

    /// Empties the buffer. Statistics are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_pos = 0;
        inner.read_pos = 0;
        inner.available = 0;
        self.not_full.notify_all();
    }

    /// Marks the buffer closed and wakes all blocked readers, which then
    /// return the `-1` sentinel. Used for cooperative worker shutdown.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Current number of buffered bytes.
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().available
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current fill level expressed in milliseconds of audio.
    pub fn buffer_level_ms(&self) -> u64 {
        self.format.bytes_to_ms(self.available())
    }

    /// Current fill level as a percentage of capacity.
    pub fn fill_percent(&self) -> u32 {
        if self.capacity == 0 {
            return 0;
        }
        (self.available() * 100 / self.capacity) as u32
    }

    /// Whether initial buffering has reached the target watermark.
    pub fn has_reached_target_level(&self) -> bool {
        self.buffer_level_ms() >= self.policy.target_ms as u64
    }

    pub fn is_below_minimum(&self) -> bool {
        self.buffer_level_ms() < self.policy.min_ms as u64
    }

    pub fn is_above_maximum(&self) -> bool {
        self.buffer_level_ms() > self.policy.max_ms as u64
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock().unwrap();
        BufferStats {
            total_bytes_written: inner.total_bytes_written,
            total_bytes_read: inner.total_bytes_read,
            underrun_count: inner.underrun_count,
            overrun_count: inner.overrun_count,
        }
    }

    pub fn reset_statistics(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_bytes_written = 0;
        inner.total_bytes_read = 0;
        inner.underrun_count = 0;
        inner.overrun_count = 0;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("RingBuffer")
            .field("label", &self.label)
            .field("available", &inner.available)
            .field("capacity", &self.capacity)
            .field("underruns", &inner.underrun_count)
            .field("overruns", &inner.overrun_count)
            .finish()
    }
}
