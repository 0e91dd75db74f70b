//! Append-only task output.

use chrono::{DateTime, Utc};

use crate::types::Chunk;

/// Ordered output of one task.
///
/// Sequence numbers start at 0 and equal the chunk's index, so a reader that
/// remembers the next sequence it wants can resume from there at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStream {
    chunks: Vec<Chunk>,
}

impl ChunkStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a stream from persisted chunks, keeping only a gap-free prefix.
    pub fn from_chunks(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        let mut stream = ChunkStream::new();
        for chunk in chunks {
            if chunk.seq != stream.next_seq() {
                break;
            }
            stream.chunks.push(chunk);
        }
        stream
    }

    /// Appends `text` and returns the stored chunk.
    pub fn append(&mut self, text: impl Into<String>, now: DateTime<Utc>) -> &Chunk {
        let seq = self.next_seq();
        self.chunks.push(Chunk {
            seq,
            text: text.into(),
            created_at: now,
        });
        &self.chunks[self.chunks.len() - 1]
    }

    /// Every chunk with `seq >= from`.
    pub fn read_from(&self, from: u64) -> &[Chunk] {
        let start = usize::try_from(from).map_or(self.chunks.len(), |i| i.min(self.chunks.len()));
        &self.chunks[start..]
    }

    /// The sequence number the next append will get.
    pub fn next_seq(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}
