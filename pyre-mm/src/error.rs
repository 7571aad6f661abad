//! Fatal Error Reporting
//!
//! The loader has no meaningful recovery from a programming error or from
//! running out of memory while placing the kernel. Both reporters log the
//! condition and then divert to the binary's panic handler, which owns the
//! console presentation and the halt-or-shell decision. Neither returns;
//! callers must not attempt to continue past them.

/// Raise an internal error: a condition that indicates a bug in the loader.
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {{
        ::log::error!("internal error: {}", ::core::format_args!($($arg)*));
        ::core::panic!($($arg)*);
    }};
}

/// Raise a boot error: the current load cannot continue, through no fault of
/// the loader itself (for example, not enough memory to place the kernel).
#[macro_export]
macro_rules! boot_error {
    ($($arg:tt)*) => {{
        ::log::error!("boot error: {}", ::core::format_args!($($arg)*));
        ::core::panic!($($arg)*);
    }};
}
