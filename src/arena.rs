//! String arena — linked blocks of interned descriptor strings.
//!
//! The reader parses many small strings out of chunk payloads whose backing
//! buffer is reused for every read, so the strings are copied into an arena
//! that lives until close.  Blocks are chained; a string that would not fit
//! in the remaining space of the current block is placed at the start of a
//! fresh block, so every interned string is contiguous and can be handed out
//! as a single borrowed `&str`.
//!
//! Access is by [`StrRef`] handle rather than by reference, which keeps the
//! arena growable while readers hold handles into it.

/// Default block size.  Fresh blocks are at least this large; a longer
/// string gets a block of its own size.
pub const BLOCK_SIZE: usize = 8 << 20;

/// Handle to an interned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef {
    block: u32,
    start: u32,
    len:   u32,
}

pub struct StringArena {
    blocks:     Vec<Vec<u8>>,
    block_size: usize,
}

impl StringArena {
    pub fn new() -> Self {
        Self::with_block_size(BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            block_size: block_size.max(1),
        }
    }

    /// Copy `s` into the arena and return its handle.
    pub fn intern(&mut self, s: &str) -> StrRef {
        let bytes = s.as_bytes();
        let fits = self
            .blocks
            .last()
            .map(|b| b.capacity() - b.len() >= bytes.len())
            .unwrap_or(false);
        if !fits {
            self.blocks
                .push(Vec::with_capacity(self.block_size.max(bytes.len())));
        }
        let block = self.blocks.len() - 1;
        let current = &mut self.blocks[block];
        let start = current.len();
        current.extend_from_slice(bytes);
        StrRef {
            block: block as u32,
            start: start as u32,
            len:   bytes.len() as u32,
        }
    }

    /// Resolve a handle produced by [`intern`](Self::intern).
    pub fn get(&self, r: StrRef) -> &str {
        let block = &self.blocks[r.block as usize];
        let bytes = &block[r.start as usize..(r.start + r.len) as usize];
        // intern only ever copies bytes out of a valid &str, and interned
        // ranges are never mutated afterwards.
        std::str::from_utf8(bytes).unwrap()
    }
}

impl Default for StringArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_and_resolve() {
        let mut a = StringArena::with_block_size(16);
        let hello = a.intern("hello");
        let world = a.intern("world");
        assert_eq!(a.get(hello), "hello");
        assert_eq!(a.get(world), "world");
    }

    #[test]
    fn string_never_spans_blocks() {
        let mut a = StringArena::with_block_size(8);
        let first = a.intern("abcdef");
        // Does not fit after the first string; must move to a fresh block
        // whole, not split across the boundary.
        let second = a.intern("ghijkl");
        assert_eq!(a.get(first), "abcdef");
        assert_eq!(a.get(second), "ghijkl");
        assert_eq!(a.blocks.len(), 2);
    }

    #[test]
    fn oversized_string_gets_own_block() {
        let mut a = StringArena::with_block_size(4);
        let big = a.intern("a longer string than the block");
        assert_eq!(a.get(big), "a longer string than the block");
    }
}
