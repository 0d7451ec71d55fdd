// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only in-memory buffer of ordered SSE lines for a single session.
//!
//! A chunk's index never changes once appended; `snapshot()` always observes
//! a consistent prefix because callers append and snapshot under the same
//! guard (see `StreamSession`'s fan-out loop).

/// A single raw SSE line plus whether it carries the stream terminator.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub line: String,
    pub is_final: bool,
}

/// Append-only, insertion-ordered chunk buffer with a byte-size cap.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: Vec<StoredChunk>,
    byte_len: usize,
    max_bytes: usize,
}

impl ChunkStore {
    pub fn new(max_bytes: usize) -> Self {
        Self { chunks: Vec::new(), byte_len: 0, max_bytes }
    }

    /// Append a line, returning a clone of the stored chunk for broadcast.
    /// Returns `Err(())` if doing so would exceed the configured byte cap —
    /// the caller must transition the session to `Errored(OversizedStream)`
    /// and stop appending.
    pub fn append(&mut self, line: String, is_final: bool) -> Result<StoredChunk, ()> {
        let incoming = line.len();
        if self.byte_len.saturating_add(incoming) > self.max_bytes {
            return Err(());
        }
        self.byte_len += incoming;
        let chunk = StoredChunk { line, is_final };
        self.chunks.push(chunk.clone());
        Ok(chunk)
    }

    /// Take a consistent prefix snapshot of every chunk appended so far.
    pub fn snapshot(&self) -> Vec<StoredChunk> {
        self.chunks.clone()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_snapshot_preserve_order() {
        let mut store = ChunkStore::new(1024);
        store.append("data: one".to_owned(), false).unwrap();
        store.append("data: two".to_owned(), false).unwrap();
        let last = store.append("data: [DONE]".to_owned(), true).unwrap();
        assert!(last.is_final);

        let snap = store.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].line, "data: one");
        assert!(snap[2].is_final);
    }

    #[test]
    fn append_rejects_once_over_cap() {
        let mut store = ChunkStore::new(8);
        assert!(store.append("12345678".to_owned(), false).is_ok());
        assert!(store.append("x".to_owned(), false).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshot_is_a_clone_not_a_view() {
        let mut store = ChunkStore::new(1024);
        store.append("data: a".to_owned(), false).unwrap();
        let snap1 = store.snapshot();
        store.append("data: b".to_owned(), false).unwrap();
        assert_eq!(snap1.len(), 1);
        assert_eq!(store.len(), 2);
    }
}
