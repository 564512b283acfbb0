//! Debouncing of streamed completion tokens into submission-sized chunks.

/// Characters after which buffered text is worth sending.
const DELIMITERS: [char; 5] = ['\n', '.', '?', '!', ','];

/// Accumulates streamed text and releases it at natural break points.
#[derive(Debug)]
pub struct ChunkBuffer {
    buf: String,
    flush_len: usize,
    flushed_len: usize,
}

impl ChunkBuffer {
    pub fn new(flush_len: usize) -> Self {
        Self {
            buf: String::new(),
            flush_len,
            flushed_len: 0,
        }
    }

    /// Add `part`. Returns the buffered text once it holds a delimiter or
    /// grows past the flush length.
    pub fn push(&mut self, part: &str) -> Option<String> {
        self.buf.push_str(part);
        if self.should_flush() {
            self.flushed_len += self.buf.len();
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }

    /// Whatever is left, possibly empty.
    pub fn finish(&mut self) -> String {
        self.flushed_len += self.buf.len();
        std::mem::take(&mut self.buf)
    }

    /// Bytes released so far, including by `finish`.
    pub fn total_len(&self) -> usize {
        self.flushed_len + self.buf.len()
    }

    fn should_flush(&self) -> bool {
        self.buf.len() > self.flush_len || self.buf.contains(DELIMITERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_until_delimiter() {
        let mut chunks = ChunkBuffer::new(100);
        assert_eq!(chunks.push("Hel"), None);
        assert_eq!(chunks.push("lo"), None);
        assert_eq!(chunks.push(" world!"), Some("Hello world!".to_string()));
        assert_eq!(chunks.finish(), "");
    }

    #[test]
    fn every_delimiter_flushes() {
        for d in ["\n", ".", "?", "!", ","] {
            let mut chunks = ChunkBuffer::new(100);
            assert_eq!(chunks.push(&format!("a{d}")), Some(format!("a{d}")));
        }
    }

    #[test]
    fn long_runs_flush_without_delimiter() {
        let mut chunks = ChunkBuffer::new(10);
        assert_eq!(chunks.push("abcdefghij"), None);
        assert_eq!(chunks.push("k"), Some("abcdefghijk".to_string()));
    }

    #[test]
    fn finish_returns_tail_and_counts_total() {
        let mut chunks = ChunkBuffer::new(100);
        chunks.push("one, ");
        chunks.push("two");
        assert_eq!(chunks.total_len(), 8);
        assert_eq!(chunks.finish(), "two");
        assert_eq!(chunks.total_len(), 8);
    }
}
