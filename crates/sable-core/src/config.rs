// Configuration for the storage layer
//
// PoolConfig is handed to MemoryPool::new and read back by every
// TensorStorage allocated from that pool, so one pool means one padding
// convention.

/// Memory pool and buffer layout configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Alignment target for dense rows in bytes (default: 32).
    /// Column extents are padded to a multiple of `alignment_bytes / 4`.
    pub alignment_bytes: usize,
    /// Keep released buffers in per-size free lists for reuse (default: true).
    pub caching: bool,
    /// Upper bound on bytes held in the free lists. Buffers released past the
    /// bound are freed immediately. `None` means unbounded.
    pub max_cached_bytes: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            alignment_bytes: 32,
            caching: true,
            max_cached_bytes: None,
        }
    }
}

impl PoolConfig {
    /// Set the row alignment in bytes. Values below one element are rounded
    /// up to one element.
    pub fn with_alignment_bytes(mut self, bytes: usize) -> Self {
        self.alignment_bytes = bytes;
        self
    }

    /// Enable or disable free-list caching.
    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    /// Bound the bytes held in the free lists.
    pub fn with_max_cached_bytes(mut self, bytes: usize) -> Self {
        self.max_cached_bytes = Some(bytes);
        self
    }

    /// Padding unit in `f32` elements.
    pub fn pad_unit(&self) -> usize {
        (self.alignment_bytes / std::mem::size_of::<f32>()).max(1)
    }
}

/// Round `n` up to the next multiple of `unit`.
pub fn pad_to(n: usize, unit: usize) -> usize {
    if n % unit == 0 {
        n
    } else {
        n / unit * unit + unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pad_unit() {
        assert_eq!(PoolConfig::default().pad_unit(), 8);
        assert_eq!(PoolConfig::default().with_alignment_bytes(2).pad_unit(), 1);
    }

    #[test]
    fn test_pad_to() {
        assert_eq!(pad_to(8, 8), 8);
        assert_eq!(pad_to(9, 8), 16);
        assert_eq!(pad_to(1, 8), 8);
    }
}
