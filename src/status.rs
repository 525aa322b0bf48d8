//! A closed outcome enumeration used uniformly in place of an open-ended error hierarchy.
//!
//! Mirrors the Zircon `zx_status_t` flavour of the device this crate's session layer was modeled
//! on, and the same spirit as this crate's own lower-level [`Errno`]-style wrappers: a small,
//! fixed set of codes with an allocation-free [`core::fmt::Display`] impl, not a derive-macro
//! error tree.

use core::fmt;

/// Outcome of a fallible operation on the session/device-interface surface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum Status {
    /// The operation completed successfully.
    Ok,
    /// A caller-supplied argument violates a documented precondition.
    InvalidArgs,
    /// The requested capability or version is not supported by this device.
    NotSupported,
    /// Allocation failed.
    NoMemory,
    /// A fixed-capacity resource (VMO slot, FIFO depth, in-flight slab) is exhausted.
    NoResources,
    /// The object is not in a state that permits this operation.
    BadState,
    /// The device is not currently able to service the request (e.g. stopped).
    Unavailable,
    /// The operation would block; the caller should wait and retry.
    ShouldWait,
    /// A fixed-capacity in-flight slab is full; descriptors must drain before more are queued.
    IoOverrun,
    /// A value (offset, length, index) falls outside its valid range.
    OutOfRange,
    /// No entry exists for the given key.
    NotFound,
    /// The operation was canceled, typically by a concurrent teardown.
    Canceled,
    /// An internal invariant was violated in a way that does not map to another code.
    Internal,
}

impl Status {
    /// Whether this status represents success.
    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }

    /// A short, stable string identifier for the status, suitable for log messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::InvalidArgs => "INVALID_ARGS",
            Status::NotSupported => "NOT_SUPPORTED",
            Status::NoMemory => "NO_MEMORY",
            Status::NoResources => "NO_RESOURCES",
            Status::BadState => "BAD_STATE",
            Status::Unavailable => "UNAVAILABLE",
            Status::ShouldWait => "SHOULD_WAIT",
            Status::IoOverrun => "IO_OVERRUN",
            Status::OutOfRange => "OUT_OF_RANGE",
            Status::NotFound => "NOT_FOUND",
            Status::Canceled => "CANCELED",
            Status::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Status {}

/// Convenience alias for results returned across the session/device-interface surface.
pub type Result<T> = core::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ok_only_for_ok_variant() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::BadState.is_ok());
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(Status::NoResources.to_string(), "NO_RESOURCES");
    }
}
