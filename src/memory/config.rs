use super::error::AllocError;

/// Block granularity in bytes. Every small block is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Largest request served from the size-class free lists. Anything larger is
/// forwarded to the system allocator.
pub const SMALL_THRESHOLD: usize = 128;

/// Objects requested from the arena per refill.
pub const BATCH: usize = 20;

/// Slab growth slack: each new slab adds `heap_size / GROWTH_DIVISOR` bytes on
/// top of twice the triggering request.
pub const GROWTH_DIVISOR: usize = 16;

/// Upper bound on the number of size classes a thread cache can hold.
pub const MAX_CLASSES: usize = 64;

/// Callback consulted when memory is exhausted.
///
/// Returning `true` means memory was released and the allocation should be
/// retried; `false` gives up and surfaces [`AllocError::OutOfMemory`].
pub type OomHandler = fn() -> bool;

/// Configuration for `NodeAllocator`. All fields have sensible defaults.
/// Set at construction time via `NodeAllocator::with_config()`.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Size-class granularity. Power of two, at least pointer-sized.
    /// Default: 8.
    pub alignment: usize,

    /// Largest size served by the free lists. Non-zero multiple of
    /// `alignment`, at most `MAX_CLASSES * alignment`. Default: 128.
    pub small_threshold: usize,

    /// Objects carved per refill. Default: 20.
    pub batch: usize,

    /// Divisor applied to the cumulative heap size when sizing a new slab.
    /// Default: 16.
    pub growth_divisor: usize,

    /// Optional out-of-memory callback. Default: none (fail immediately).
    pub oom_handler: Option<OomHandler>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            alignment: ALIGNMENT,
            small_threshold: SMALL_THRESHOLD,
            batch: BATCH,
            growth_divisor: GROWTH_DIVISOR,
            oom_handler: None,
        }
    }
}

impl PoolConfig {
    /// Number of size classes this configuration produces.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.small_threshold.div_ceil(self.alignment.max(1))
    }

    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` naming the first violated rule.
    pub fn validate(&self) -> Result<(), AllocError> {
        let invalid = |msg: String| Err(AllocError::InvalidConfig(msg));

        if !self.alignment.is_power_of_two() {
            return invalid(format!("alignment {} is not a power of two", self.alignment));
        }
        if self.alignment < std::mem::size_of::<usize>() {
            return invalid(format!(
                "alignment {} cannot hold a free-list link ({} bytes)",
                self.alignment,
                std::mem::size_of::<usize>()
            ));
        }
        if self.small_threshold == 0 || !self.small_threshold.is_multiple_of(self.alignment) {
            return invalid(format!(
                "small_threshold {} must be a non-zero multiple of alignment {}",
                self.small_threshold, self.alignment
            ));
        }
        if self.class_count() > MAX_CLASSES {
            return invalid(format!(
                "{} size classes exceed the limit of {MAX_CLASSES}",
                self.class_count()
            ));
        }
        if self.batch == 0 {
            return invalid("batch must be at least 1".to_string());
        }
        if self.growth_divisor == 0 {
            return invalid("growth_divisor must be at least 1".to_string());
        }
        Ok(())
    }
}
