//! # Kernel Error Taxonomy
//!
//! One error enum shared by every subsystem. Kernel-internal calls return
//! `Result<T, KernelError>`; the numeric codes exist for the boundaries
//! that speak the negative-integer convention (syscall returns, the
//! filesystem dispatch layer).

/// Errors produced by kernel subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Disk or filesystem read failure, missing file, out-of-range seek
    Io,
    /// Bad alignment, bad path component, bad syscall argument
    InvalidArgument,
    /// Heap or slot exhaustion
    NoMemory,
    /// Path syntax invalid
    BadPath,
    /// Filesystem signature mismatch during resolve
    FsNotUs,
    /// Write or append requested on a read-only filesystem
    ReadOnly,
    /// Feature stub (e.g. SEEK_END)
    Unimplemented,
    /// Process slot or resource already in use
    Taken,
    /// ELF header rejection
    InvalidFormat,
}

impl KernelError {
    /// Returns the positive status code; callers negate it when returning
    /// an `int`-style error.
    pub const fn code(self) -> i32 {
        match self {
            KernelError::Io => 1,
            KernelError::InvalidArgument => 2,
            KernelError::NoMemory => 3,
            KernelError::BadPath => 4,
            KernelError::FsNotUs => 5,
            KernelError::ReadOnly => 6,
            KernelError::Unimplemented => 7,
            KernelError::Taken => 8,
            KernelError::InvalidFormat => 9,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::Io => write!(f, "I/O error"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::NoMemory => write!(f, "out of memory"),
            KernelError::BadPath => write!(f, "bad path"),
            KernelError::FsNotUs => write!(f, "filesystem signature mismatch"),
            KernelError::ReadOnly => write!(f, "read-only filesystem"),
            KernelError::Unimplemented => write!(f, "unimplemented"),
            KernelError::Taken => write!(f, "already in use"),
            KernelError::InvalidFormat => write!(f, "invalid format"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(KernelError::Io.code(), 1);
        assert_eq!(KernelError::InvalidFormat.code(), 9);
    }
}
