// src/context.rs
//! Context extension traits + macros for error handling.
//!
//! `.context()` / `.with_context()` on `Result` and `Option`, plus `bail!` and `ensure!`
//! for the setup-time checks (capacity, stage order, config) that must fail loudly.

use crate::error::{Error, Result};

/// `.context()` / `.with_context()` on any `Result` whose error converts into [`Error`].
pub trait Context<T> {
    /// Eager context (use only when cheap).
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Lazy context; the closure only runs on the error path.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// `Option<T>` → `Result<T>` with a message.
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(f()))
    }
}

// ====================== CONVENIENCE MACROS ======================

/// Early return with an error: `bail!("msg")`, `bail!(err)` or formatted.
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::Error::format(format_args!($msg)))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::Error>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::format(format_args!($fmt, $($arg)*)))
    };
}

/// Ensure a condition holds, else `bail!`.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !($cond) {
            $crate::bail!($msg);
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !($cond) {
            $crate::bail!($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked_count(count: u32, capacity: u32) -> Result<u32> {
        crate::ensure!(
            count <= capacity,
            Error::CapacityExceeded {
                requested: count,
                capacity
            }
        );
        Ok(count)
    }

    #[test]
    fn ensure_returns_the_given_error() {
        assert_eq!(checked_count(3, 4).ok(), Some(3));
        let err = checked_count(5, 4).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { requested: 5, .. }));
    }

    #[test]
    fn option_context_builds_custom_error() {
        let missing: Option<u32> = None;
        let err = missing.context("no pyramid level 12").unwrap_err();
        assert_eq!(err.to_string(), "no pyramid level 12");
    }

    #[test]
    fn result_context_wraps() {
        let res: std::result::Result<(), Error> = Err(Error::DeviceLost("readback"));
        let err = res.with_context(|| "frame 7").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().starts_with("frame 7: "));
    }
}
