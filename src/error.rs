use thiserror::Error;

/// Errors reported by a [`crate::Pool`].
///
/// Both variants mean the system refused memory. Contract violations such as
/// double frees are not reported here, they cannot be expressed with the
/// [`crate::Allocation`] handle and are debug assertions otherwise.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The first block of a new pool could not be obtained.
    #[error("Pool creation failed: system refused {requested} bytes")]
    Allocation {
        /// Size of the region that was asked for.
        requested: usize,
    },

    /// Growth, a large allocation or its descriptor could not be obtained.
    #[error("Out of memory: system refused {requested} bytes")]
    OutOfMemory {
        /// Size of the region that was asked for.
        requested: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_size() {
        let err = PoolError::Allocation { requested: 4096 };
        assert_eq!(err.to_string(), "Pool creation failed: system refused 4096 bytes");

        let err = PoolError::OutOfMemory { requested: 12 };
        assert_eq!(err.to_string(), "Out of memory: system refused 12 bytes");
    }
}
