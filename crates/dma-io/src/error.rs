use core::fmt;

/// Errors from translation, staging copies and request bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// No scatter/gather or staging buffer is free. Retry after a recycle.
    ResourceExhausted,
    /// The restrictions cannot carry even one block of the request.
    ConstraintUnsatisfiable,
    /// Bookkeeping memory or a DMA region could not be allocated.
    AllocationFailure,
    /// Copying between caller memory and a staging buffer failed.
    CopyFailure,
    /// The device reported that the transfer failed.
    DeviceError,
    /// Waiting for a request to finish timed out.
    TimedOut,
    /// Bad offset, unknown request id, or misuse of a buffer.
    InvalidArgument,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            IoError::ResourceExhausted => "no DMA buffer available",
            IoError::ConstraintUnsatisfiable => "transfer cannot satisfy device restrictions",
            IoError::AllocationFailure => "allocation failed",
            IoError::CopyFailure => "copy to or from caller memory failed",
            IoError::DeviceError => "device I/O error",
            IoError::TimedOut => "timed out",
            IoError::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(IoError::TimedOut.to_string(), "timed out");
        assert_eq!(
            IoError::ResourceExhausted.to_string(),
            "no DMA buffer available"
        );
    }
}
