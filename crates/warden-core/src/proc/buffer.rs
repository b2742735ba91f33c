//! Accumulating buffer for one pipe endpoint.

/// Byte buffer with a read cursor.
///
/// The pump appends whatever a pipe had ready; callers consume at their own
/// pace. `data[read_pos..]` is the unread range. Once a drain catches up
/// with the end the storage is truncated and the cursor rewound, so a
/// buffer that is regularly drained does not grow without bound.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unread bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.data.len()
    }

    /// The unread range, without consuming it.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Move the cursor forward by up to `n` bytes.
    pub fn advance(&mut self, n: usize) {
        self.read_pos = self.read_pos.saturating_add(n).min(self.data.len());
        self.compact();
    }

    /// Take up to `n` bytes from the front of the unread range.
    pub fn consume(&mut self, n: usize) -> Vec<u8> {
        let end = self.read_pos.saturating_add(n).min(self.data.len());
        let out = self.data[self.read_pos..end].to_vec();
        self.read_pos = end;
        self.compact();
        out
    }

    /// Take everything unread.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.consume(usize::MAX)
    }

    /// Take one line, including its `\n`. `None` while no complete line is
    /// buffered; a trailing partial line stays in the buffer.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.pending().iter().position(|&b| b == b'\n')?;
        Some(self.consume(newline + 1))
    }

    fn compact(&mut self) {
        if self.read_pos == self.data.len() {
            self.data.clear();
            self.read_pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_consume() {
        let mut buf = StreamBuffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.len(), 11);

        assert_eq!(buf.consume(6), b"hello ");
        assert_eq!(buf.pending(), b"world");
        assert_eq!(buf.consume(100), b"world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_compaction_on_full_drain() {
        let mut buf = StreamBuffer::new();
        buf.append(b"abc");
        buf.advance(3);
        assert!(buf.is_empty());

        // Storage was rewound: new data starts at the front again.
        buf.append(b"xyz");
        assert_eq!(buf.pending(), b"xyz");
        assert_eq!(buf.consume(usize::MAX), b"xyz");
    }

    #[test]
    fn test_partial_advance_keeps_rest() {
        let mut buf = StreamBuffer::new();
        buf.append(b"12345");
        buf.advance(2);
        assert_eq!(buf.pending(), b"345");
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_take_line() {
        let mut buf = StreamBuffer::new();
        buf.append(b"one\ntwo\nthr");

        assert_eq!(buf.take_line().unwrap(), b"one\n");
        assert_eq!(buf.take_line().unwrap(), b"two\n");
        // "thr" has no newline yet.
        assert!(buf.take_line().is_none());
        assert_eq!(buf.pending(), b"thr");

        buf.append(b"ee\n");
        assert_eq!(buf.take_line().unwrap(), b"three\n");
    }

    #[test]
    fn test_take_all() {
        let mut buf = StreamBuffer::new();
        buf.append(b"rest");
        buf.advance(1);
        assert_eq!(buf.take_all(), b"est");
        assert!(buf.is_empty());
    }
}
