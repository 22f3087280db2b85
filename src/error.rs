#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    TooManyThreads,
    TooManyLocks,
    NotInitialized,
    AlreadyStarted,
}

impl KernelError {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelError::TooManyThreads => "Thread table is full",
            KernelError::TooManyLocks => "Lock table is full",
            KernelError::NotInitialized => "Kernel has not been initialized",
            KernelError::AlreadyStarted => "Kernel has already been started",
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
