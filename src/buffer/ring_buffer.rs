/// Fixed-capacity circular byte buffer backing a session's receive stream.
///
/// `head` is the write cursor, `tail` the read cursor, both wrapping modulo
/// the capacity. Scatter I/O works directly against the buffer storage: a
/// caller takes the free region as up to two spans (`enqueue_spans`), lets the
/// socket write into them, and commits the transferred byte count afterwards
/// with `move_head`. The struct itself is unsynchronized; the owning session
/// serializes access through a single lock.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    used: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn size_in_use(&self) -> usize {
        self.used
    }

    pub fn free_space(&self) -> usize {
        self.buf.len() - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.buf.len()
    }

    /// Length of the contiguous free region starting at `head`, before wrap.
    pub fn direct_enqueue_size(&self) -> usize {
        if self.is_full() {
            return 0;
        }
        if self.head >= self.tail {
            self.buf.len() - self.head
        } else {
            self.tail - self.head
        }
    }

    /// Length of the contiguous used region starting at `tail`, before wrap.
    pub fn direct_dequeue_size(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        if self.tail >= self.head {
            self.buf.len() - self.tail
        } else {
            self.head - self.tail
        }
    }

    /// The free region as a (direct, wrapped) span pair whose total length is
    /// exactly `free_space()`. Bytes written into the spans are not visible
    /// until committed with `move_head`.
    pub fn enqueue_spans(&mut self) -> (&mut [u8], &mut [u8]) {
        let free = self.free_space();
        let head = self.head;
        let first = free.min(self.buf.len() - head);
        let second = free - first;
        let (lo, hi) = self.buf.split_at_mut(head);
        (&mut hi[..first], &mut lo[..second])
    }

    /// The used region as a (direct, wrapped) span pair whose total length is
    /// exactly `size_in_use()`.
    pub fn dequeue_spans(&self) -> (&[u8], &[u8]) {
        let used = self.used;
        let tail = self.tail;
        let first = used.min(self.buf.len() - tail);
        let second = used - first;
        let (lo, hi) = self.buf.split_at(tail);
        (&hi[..first], &lo[..second])
    }

    /// Copying write. Rejected outright if `data` exceeds the free space.
    pub fn put(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free_space() {
            return false;
        }
        let direct = data.len().min(self.buf.len() - self.head);
        self.buf[self.head..self.head + direct].copy_from_slice(&data[..direct]);
        self.buf[..data.len() - direct].copy_from_slice(&data[direct..]);
        self.head = (self.head + data.len()) % self.buf.len();
        self.used += data.len();
        true
    }

    /// Copy `out.len()` bytes starting at `tail` without consuming them.
    /// Fails if more bytes are requested than are in use.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        if out.len() > self.used {
            return false;
        }
        let total = out.len();
        let direct = total.min(self.buf.len() - self.tail);
        out[..direct].copy_from_slice(&self.buf[self.tail..self.tail + direct]);
        out[direct..].copy_from_slice(&self.buf[..total - direct]);
        true
    }

    /// Commit `n` bytes previously written into the enqueue spans. No-ops if
    /// `n` exceeds the free space.
    pub fn move_head(&mut self, n: usize) {
        if n > self.free_space() {
            return;
        }
        self.head = (self.head + n) % self.buf.len();
        self.used += n;
    }

    /// Consume `n` bytes from `tail`. Fails if `n` exceeds the bytes in use.
    pub fn move_tail(&mut self, n: usize) -> bool {
        if n > self.used {
            return false;
        }
        self.tail = (self.tail + n) % self.buf.len();
        self.used -= n;
        true
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.used = 0;
    }
}
