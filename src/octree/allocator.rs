//! Append-only u32 store with deferred ordered insertions
//!
//! The octree builder appends descriptors before it knows whether a child
//! offset needs a far-pointer word. Far-pointer words must land immediately
//! after descriptors that may be buried under thousands of later appends;
//! recording them as deferred insertions and merging once in `finalize`
//! avoids the quadratic shifting a plain `Vec::insert` would cost.

use crate::core::error::Error;
use crate::core::types::Result;

const CHUNK_SIZE: usize = 4096;

/// Chunked append-only sequence of u32 words
pub struct ChunkedAllocator {
    size: u64,
    chunks: Vec<Box<[u32; CHUNK_SIZE]>>,
    insertions: Vec<(u64, u32)>,
}

impl ChunkedAllocator {
    pub fn new() -> Self {
        Self {
            size: 0,
            chunks: Vec::new(),
            insertions: Vec::new(),
        }
    }

    /// Number of appended words (insertions not counted)
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of pending deferred insertions
    pub fn insertion_count(&self) -> u64 {
        self.insertions.len() as u64
    }

    pub fn push_back(&mut self, value: u32) {
        if self.size as usize % CHUNK_SIZE == 0 {
            self.chunks.push(Box::new([0u32; CHUNK_SIZE]));
        }
        self.chunks[self.size as usize / CHUNK_SIZE][self.size as usize % CHUNK_SIZE] = value;
        self.size += 1;
    }

    /// Read an appended word
    pub fn get(&self, idx: u64) -> u32 {
        debug_assert!(idx < self.size);
        self.chunks[idx as usize / CHUNK_SIZE][idx as usize % CHUNK_SIZE]
    }

    /// Overwrite an appended word
    pub fn set(&mut self, idx: u64, value: u32) {
        debug_assert!(idx < self.size);
        self.chunks[idx as usize / CHUNK_SIZE][idx as usize % CHUNK_SIZE] = value;
    }

    /// Schedule `value` to appear before the word currently at logical
    /// position `idx`. Insertions at equal positions keep their submission
    /// order.
    pub fn insert(&mut self, idx: u64, value: u32) -> Result<()> {
        if idx > self.size {
            return Err(Error::InvalidIndex {
                idx,
                len: self.size,
            });
        }
        self.insertions.push((idx, value));
        Ok(())
    }

    /// Merge appends and insertions into one contiguous array, freeing
    /// chunks as they are consumed.
    pub fn finalize(mut self) -> Vec<u32> {
        // Stable sort keeps same-index insertions in submission order
        self.insertions.sort_by_key(|&(idx, _)| idx);

        let mut result = Vec::with_capacity(self.size as usize + self.insertions.len());
        let mut pending = self.insertions.into_iter().peekable();

        let mut index = 0u64;
        for chunk in self.chunks.into_iter() {
            let used = CHUNK_SIZE.min((self.size - index) as usize);
            for &value in &chunk[..used] {
                while let Some(&(idx, inserted)) = pending.peek() {
                    if idx != index {
                        break;
                    }
                    result.push(inserted);
                    pending.next();
                }
                result.push(value);
                index += 1;
            }
        }
        for (_, value) in pending {
            result.push(value);
        }

        result
    }
}

impl Default for ChunkedAllocator {
    fn default() -> Self {
        Self::new()
    }
}
