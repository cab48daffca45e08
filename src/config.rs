use serde::Deserialize;

use crate::DEFAULT_POOL_SIZE;

/// Creation parameters of a [`crate::Pool`].
///
/// Deserializable so a host process can embed it in its own configuration
/// file. Missing fields take their [`Default`] value. `0` means "not
/// configured" for `growth_step` and `max_alloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size of the first block. Clamped up to [`crate::MIN_POOL_SIZE`].
    pub initial_size: usize,
    /// Size of every block added later. Falls back to `initial_size` unless it
    /// is larger than [`crate::MIN_POOL_SIZE`].
    pub growth_step: usize,
    /// Cap on the effective size of a small allocation.
    pub max_alloc: usize,
    /// Verbose logging of growth and recycling for this pool.
    pub traced: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_POOL_SIZE,
            growth_step: 0,
            max_alloc: 0,
            traced: false,
        }
    }
}

impl PoolConfig {
    pub fn new(initial_size: usize) -> Self {
        Self {
            initial_size,
            ..Self::default()
        }
    }

    pub fn growth_step(mut self, growth_step: usize) -> Self {
        self.growth_step = growth_step;
        self
    }

    pub fn max_alloc(mut self, max_alloc: usize) -> Self {
        self.max_alloc = max_alloc;
        self
    }

    pub fn traced(mut self, traced: bool) -> Self {
        self.traced = traced;
        self
    }
}
