//! Kernel-specific error types.

use parley_types::error::ParleyError;
use thiserror::Error;

/// Kernel error type wrapping ParleyError with boot-time context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped ParleyError.
    #[error(transparent)]
    Parley(#[from] ParleyError),

    /// The coordinator failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
