/// Kernel-internal error kinds. System calls convert these to the negative
/// integer convention exactly once, at the trap boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A user pointer failed validation, a tid was unknown, a length was
    /// negative, or a region argument was mis-aligned or overlapping.
    Invalid,
    /// An argument vector exceeded its cap.
    TooBig,
    /// The user frame pool is exhausted.
    NoMem,
    /// The operation cannot succeed: suspended yield target, no children to
    /// wait for, program absent or not a valid executable.
    Failure,
}

impl KernelError {
    pub fn code(self) -> i32 {
        match self {
            KernelError::Invalid => -1,
            KernelError::TooBig => -2,
            KernelError::NoMem => -3,
            KernelError::Failure => -4,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
