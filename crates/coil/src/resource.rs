//! Execution limits.
//!
//! The VM enforces a call-stack depth ceiling so runaway recursion in the
//! executing program surfaces as a `RecursionError`-class failure instead
//! of exhausting the host stack. Limit violations are uncatchable: the
//! executing program cannot suppress them with an except-guard block.

/// Default maximum call-stack depth.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Limits applied to a VM instance.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Maximum number of frames on the call stack at any point.
    pub max_recursion_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
        }
    }
}

impl ResourceLimits {
    /// Limits with a custom recursion ceiling.
    #[must_use]
    pub fn with_max_recursion_depth(max_recursion_depth: usize) -> Self {
        Self { max_recursion_depth }
    }
}
