//! Scatter/gather I/O-vector cursor.
//!
//! Grounded on `evpl_iovec_cursor.h`: a cursor walks a chain of
//! buffers, copying bytes in or out and tracking how much has been
//! consumed, without the caller needing to know the chain's exact
//! segmentation.
//!
//! Segments are `Arc<[u8]>` rather than owned `Vec<u8>` so a backend
//! can hand the same payload to multiple threads without copying —
//! the "reference-counted buffers for I/O payloads" the specification
//! asks for in its memory-model section.

use std::sync::Arc;

/// One scatter/gather segment.
pub type IoSegment = Arc<[u8]>;

/// A chain of buffers plus a read/write position within it.
#[derive(Debug, Clone, Default)]
pub struct IoVecCursor {
    segments: Vec<IoSegment>,
    /// Index of the current segment.
    seg: usize,
    /// Byte offset within the current segment.
    offset: usize,
    /// Total bytes consumed across the whole cursor so far.
    consumed: usize,
}

impl IoVecCursor {
    /// Build a cursor over an existing chain of segments.
    pub fn new(segments: Vec<IoSegment>) -> Self {
        Self {
            segments,
            seg: 0,
            offset: 0,
            consumed: 0,
        }
    }

    /// Build a single-segment cursor over one buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(vec![Arc::from(data)])
    }

    /// Total number of bytes remaining unconsumed in the chain.
    pub fn remaining(&self) -> usize {
        let total: usize = self.segments.iter().map(|s| s.len()).sum();
        total.saturating_sub(self.consumed)
    }

    /// Total bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    fn advance_segment_if_exhausted(&mut self) {
        while self.seg < self.segments.len() && self.offset == self.segments[self.seg].len() {
            self.seg += 1;
            self.offset = 0;
        }
    }

    /// Copy `length` bytes out of the cursor into a freshly allocated
    /// buffer, advancing the cursor. Returns `None` if fewer than
    /// `length` bytes remain (the cursor is left unchanged in that
    /// case).
    pub fn get_blob(&mut self, length: usize) -> Option<Vec<u8>> {
        if length > self.remaining() {
            return None;
        }
        let mut out = Vec::with_capacity(length);
        let mut left = length;
        while left > 0 {
            self.advance_segment_if_exhausted();
            let seg = &self.segments[self.seg];
            let chunk = left.min(seg.len() - self.offset);
            out.extend_from_slice(&seg[self.offset..self.offset + chunk]);
            self.offset += chunk;
            self.consumed += chunk;
            left -= chunk;
        }
        Some(out)
    }

    /// Skip `length` bytes without copying them out. Returns `None`
    /// (and leaves the cursor unchanged) if fewer than `length` bytes
    /// remain.
    pub fn skip(&mut self, length: usize) -> Option<()> {
        if length > self.remaining() {
            return None;
        }
        let mut left = length;
        while left > 0 {
            self.advance_segment_if_exhausted();
            let seg = &self.segments[self.seg];
            let chunk = left.min(seg.len() - self.offset);
            self.offset += chunk;
            self.consumed += chunk;
            left -= chunk;
        }
        Some(())
    }

    /// Append a segment to the chain without disturbing the current
    /// position. Used when a scatter/gather write is built up
    /// incrementally from multiple backend reads.
    pub fn push_segment(&mut self, segment: IoSegment) {
        self.segments.push(segment);
    }

    /// Flatten the remaining unconsumed bytes into a single owned
    /// buffer without advancing the cursor.
    pub fn peek_all(&self) -> Vec<u8> {
        let mut clone = self.clone();
        clone.get_blob(clone.remaining()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_of(chunks: &[&[u8]]) -> IoVecCursor {
        IoVecCursor::new(chunks.iter().map(|c| Arc::from(*c)).collect())
    }

    #[test]
    fn get_blob_spans_segments() {
        let mut cursor = cursor_of(&[b"hel", b"lo ", b"world"]);
        assert_eq!(cursor.get_blob(5).unwrap(), b"hello");
        assert_eq!(cursor.get_blob(6).unwrap(), b" world");
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn get_blob_past_end_fails_without_advancing() {
        let mut cursor = cursor_of(&[b"abc"]);
        assert!(cursor.get_blob(10).is_none());
        assert_eq!(cursor.consumed(), 0);
        assert_eq!(cursor.get_blob(3).unwrap(), b"abc");
    }

    #[test]
    fn skip_advances_without_copying() {
        let mut cursor = cursor_of(&[b"abcdef"]);
        cursor.skip(2).unwrap();
        assert_eq!(cursor.get_blob(4).unwrap(), b"cdef");
    }

    #[test]
    fn peek_all_does_not_advance() {
        let cursor = cursor_of(&[b"xyz"]);
        assert_eq!(cursor.peek_all(), b"xyz");
        assert_eq!(cursor.consumed(), 0);
    }

    #[test]
    fn empty_cursor_has_nothing_remaining() {
        let cursor = IoVecCursor::new(Vec::new());
        assert_eq!(cursor.remaining(), 0);
    }
}
