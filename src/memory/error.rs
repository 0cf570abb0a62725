use std::fmt;

/// Errors surfaced by the node allocator.
///
/// Exhaustion of the operating system is the only runtime failure; every
/// intermediate failure (a refused slab, an empty arena) is recovered
/// internally before `OutOfMemory` is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused a slab, no cached block could be salvaged, and the final
    /// minimal request also failed.
    OutOfMemory { size: usize },
    /// A `PoolConfig` was rejected by validation.
    InvalidConfig(String),
    /// The request cannot be expressed as a system layout, or a typed request
    /// needs more alignment than the pool provides.
    InvalidLayout { size: usize, align: usize },
    /// The process-wide allocator was configured after it had been set up.
    AlreadyInitialized,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { size } => {
                write!(f, "out of memory while allocating {size} bytes")
            }
            AllocError::InvalidConfig(msg) => write!(f, "invalid pool configuration: {msg}"),
            AllocError::InvalidLayout { size, align } => {
                write!(f, "invalid layout: size {size}, align {align}")
            }
            AllocError::AlreadyInitialized => f.write_str("global allocator already initialized"),
        }
    }
}

impl std::error::Error for AllocError {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            AllocError::OutOfMemory { size: 64 }.to_string(),
            "out of memory while allocating 64 bytes"
        );
        assert_eq!(
            AllocError::InvalidConfig("batch must be at least 1".to_string()).to_string(),
            "invalid pool configuration: batch must be at least 1"
        );
        assert_eq!(
            AllocError::InvalidLayout { size: 8, align: 64 }.to_string(),
            "invalid layout: size 8, align 64"
        );
        assert_eq!(
            AllocError::AlreadyInitialized.to_string(),
            "global allocator already initialized"
        );
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(AllocError::OutOfMemory { size: 1 });
        assert!(err.source().is_none());
    }
}
