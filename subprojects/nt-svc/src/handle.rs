//! Kernel object handles.
//!
//! A handle is the pointer-sized address of a boxed kernel object, so it can cross the FFI
//! boundary as a plain integer and be stored in an `AtomicUsize`.

/// Raw kernel handle value.
pub type Handle = usize;

/// The null handle, never returned by a successful create.
pub const INVALID_HANDLE: Handle = 0;

/// Declares a typed wrapper around a raw [`Handle`] for one kind of kernel object.
macro_rules! kernel_object_handle {
    {
        $(#[$meta:meta])* $vis:vis struct $name:ident
    } => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        $vis struct $name($crate::handle::Handle);

        impl $name {
            /// Wraps a raw handle.
            ///
            /// # Safety
            ///
            /// `raw` must come from [`Self::to_raw`] on a handle that has not been closed, or be
            /// [`INVALID_HANDLE`]($crate::handle::INVALID_HANDLE).
            pub unsafe fn from_raw(raw: $crate::handle::Handle) -> Self {
                Self(raw)
            }

            /// Returns the raw value, suitable for storing in an atomic or passing over FFI.
            pub fn to_raw(&self) -> $crate::handle::Handle {
                self.0
            }

            /// `false` for the null handle.
            pub fn is_valid(&self) -> bool {
                self.0 != $crate::handle::INVALID_HANDLE
            }
        }
    };
}
