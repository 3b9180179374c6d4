//! Raw status codes returned across the C FFI boundary.

/// A raw status code. Values with the two top bits set are errors.
pub type Status = u32;

/// The operation completed successfully.
pub const SUCCESS: Status = 0x0000_0000;
/// A bounded wait elapsed.
pub const TIMEOUT: Status = 0x0000_0102;
/// The operation has not completed yet; the caller is expected to finish it.
pub const PENDING: Status = 0x0000_0103;
/// Unspecified failure.
pub const UNSUCCESSFUL: Status = 0xC000_0001;
/// An invalid handle was passed.
pub const INVALID_HANDLE: Status = 0xC000_0008;
/// An invalid parameter was passed.
pub const INVALID_PARAMETER: Status = 0xC000_000D;
/// Not enough memory to complete the operation.
pub const NO_MEMORY: Status = 0xC000_0017;
/// The semaphore count would exceed its maximum.
pub const SEMAPHORE_LIMIT_EXCEEDED: Status = 0xC000_0047;
/// The caller does not own the object.
pub const NOT_OWNER: Status = 0xC000_0106;

/// Returns `true` if `status` denotes an error.
#[inline]
pub const fn is_error(status: Status) -> bool {
    status >> 30 == 0b11
}
