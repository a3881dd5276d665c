use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bounded byte queue used between pipeline stages.
///
/// Each instance has exactly one designated writer and one designated reader
/// by construction, which is what allows the light mutex-plus-condvar
/// protection instead of heavier coordination. Partial transfers are normal
/// and never an error: a stage that gets fewer bytes than asked simply
/// retries on its next scheduling slice. This is the pipeline's backpressure
/// primitive.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct Inner {
    buf: Box<[u8]>,
    read_pos: usize,
    len: usize,
}

impl Inner {
    /// Copies as much of `data` as fits into free space. Returns bytes taken.
    fn push(&mut self, data: &[u8]) -> usize {
        let capacity = self.buf.len();
        let free = capacity - self.len;
        let n = data.len().min(free);
        let write_pos = (self.read_pos + self.len) % capacity;
        let first = n.min(capacity - write_pos);
        self.buf[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        if n > first {
            self.buf[..n - first].copy_from_slice(&data[first..n]);
        }
        self.len += n;
        n
    }

    /// Copies up to `dst.len()` buffered bytes out. Returns bytes copied.
    fn pop(&mut self, dst: &mut [u8]) -> usize {
        let capacity = self.buf.len();
        let n = dst.len().min(self.len);
        let first = n.min(capacity - self.read_pos);
        dst[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        if n > first {
            dst[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        self.read_pos = (self.read_pos + n) % capacity;
        self.len -= n;
        n
    }

    /// Discards the oldest `n` buffered bytes.
    fn drop_oldest(&mut self, n: usize) {
        let n = n.min(self.len);
        self.read_pos = (self.read_pos + n) % self.buf.len();
        self.len -= n;
    }
}

impl RingBuffer {
    /// Allocates a ring with a fixed `capacity` byte arena.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                len: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Writes `data`, dropping the oldest buffered bytes to make room.
    /// Only the mixer's own scratch path uses this; pipeline stages must use
    /// [`write_without_replacement`](Self::write_without_replacement).
    pub fn write(&self, data: &[u8]) -> usize {
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let mut inner = self.lock();
        let free = self.capacity - inner.len;
        if data.len() > free {
            inner.drop_oldest(data.len() - free);
        }
        let written = inner.push(data);
        self.not_empty.notify_one();
        written
    }

    /// Writes without overwriting existing content, waiting up to `timeout`
    /// for space. Returns the number of bytes actually written, which may be
    /// less than `data.len()` (or zero) when space runs out.
    pub fn write_without_replacement(&self, data: &[u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        let mut inner = self.lock();
        loop {
            written += inner.push(&data[written..]);
            if written > 0 {
                self.not_empty.notify_one();
            }
            if written == data.len() {
                return written;
            }
            let now = Instant::now();
            if now >= deadline {
                return written;
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            inner = guard;
        }
    }

    /// Reads up to `dst.len()` bytes, waiting up to `timeout` for at least
    /// one byte to arrive. Returns the number of bytes read (possibly zero).
    pub fn read(&self, dst: &mut [u8], timeout: Duration) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.len == 0 {
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            inner = guard;
        }
        let n = inner.pop(dst);
        self.not_full.notify_one();
        n
    }

    /// Number of buffered, unread bytes.
    pub fn available(&self) -> usize {
        self.lock().len
    }

    /// Remaining writable space.
    pub fn free(&self) -> usize {
        self.capacity - self.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discards all buffered content. Used when a track changes so a stale
    /// tail cannot bleed into the next one.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.read_pos = 0;
        inner.len = 0;
        self.not_full.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const T: Duration = Duration::from_millis(50);

    #[test]
    fn round_trip_preserves_order_across_arbitrary_chunks() {
        let ring = RingBuffer::new(64);
        let data: Vec<u8> = (0..200u16).map(|v| (v % 251) as u8).collect();
        let mut out = Vec::new();

        // Interleave odd-sized writes and reads so cursors wrap repeatedly.
        let mut offset = 0;
        let chunk_sizes = [7usize, 13, 3, 29, 11, 40, 5];
        let mut i = 0;
        while offset < data.len() || out.len() < data.len() {
            if offset < data.len() {
                let n = chunk_sizes[i % chunk_sizes.len()].min(data.len() - offset);
                let written = ring.write_without_replacement(&data[offset..offset + n], T);
                offset += written;
            }
            let mut buf = [0u8; 17];
            let read = ring.read(&mut buf, Duration::ZERO);
            out.extend_from_slice(&buf[..read]);
            i += 1;
        }
        assert_eq!(out, data);
    }

    #[test]
    fn write_without_replacement_never_overwrites() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.write_without_replacement(&[1; 8], T), 8);
        // Full: a short-timeout write must return 0 and leave content intact.
        assert_eq!(ring.write_without_replacement(&[2; 4], Duration::from_millis(5)), 0);
        let mut buf = [0u8; 8];
        assert_eq!(ring.read(&mut buf, T), 8);
        assert_eq!(buf, [1; 8]);
    }

    #[test]
    fn write_drops_oldest_to_make_room() {
        let ring = RingBuffer::new(4);
        ring.write(&[1, 2, 3, 4]);
        ring.write(&[5, 6]);
        let mut buf = [0u8; 4];
        assert_eq!(ring.read(&mut buf, T), 4);
        assert_eq!(buf, [3, 4, 5, 6]);
    }

    #[test]
    fn read_times_out_on_empty() {
        let ring = RingBuffer::new(16);
        let mut buf = [0u8; 4];
        let start = Instant::now();
        assert_eq!(ring.read(&mut buf, Duration::from_millis(20)), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn reset_discards_content() {
        let ring = RingBuffer::new(16);
        ring.write(&[1, 2, 3]);
        assert_eq!(ring.available(), 3);
        ring.reset();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.free(), 16);
    }

    #[test]
    fn blocked_writer_wakes_when_reader_drains() {
        let ring = Arc::new(RingBuffer::new(4));
        ring.write(&[9; 4]);

        let writer_ring = Arc::clone(&ring);
        let writer = std::thread::spawn(move || {
            writer_ring.write_without_replacement(&[7; 4], Duration::from_secs(2))
        });

        std::thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 4];
        assert_eq!(ring.read(&mut buf, T), 4);
        assert_eq!(writer.join().unwrap(), 4);
        assert_eq!(ring.read(&mut buf, T), 4);
        assert_eq!(buf, [7; 4]);
    }
}
