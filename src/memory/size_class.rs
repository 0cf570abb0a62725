use super::config::PoolConfig;

/// Maps byte counts to free-list buckets.
///
/// Class `i` holds blocks of exactly `(i + 1) * alignment` bytes; a request
/// is rounded up to the alignment and lands in the class of that size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SizeClasses {
    alignment: usize,
    threshold: usize,
    count: usize,
}

impl SizeClasses {
    /// `config` must already be validated.
    pub(crate) fn from_config(config: &PoolConfig) -> Self {
        Self {
            alignment: config.alignment,
            threshold: config.small_threshold,
            count: config.class_count(),
        }
    }

    #[inline]
    pub(crate) fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn is_small(&self, size: usize) -> bool {
        size <= self.threshold
    }

    /// Round `size` up to the granularity. Zero is treated as one byte.
    #[inline]
    pub(crate) fn round_up(&self, size: usize) -> usize {
        (size.max(1) + self.alignment - 1) & !(self.alignment - 1)
    }

    /// Bucket index for `size`. Only meaningful for `size <= threshold`.
    #[inline]
    pub(crate) fn index(&self, size: usize) -> usize {
        debug_assert!(
            self.is_small(size),
            "size {size} above small threshold {}",
            self.threshold
        );
        self.round_up(size) / self.alignment - 1
    }

    /// Block size served by bucket `index`.
    #[inline]
    pub(crate) fn block_size(&self, index: usize) -> usize {
        (index + 1) * self.alignment
    }
}
