//! Logger initialization.
//!
//! The crate logs through the `log` facade and never talks to a concrete
//! logger directly. With the default `builtin_env_logger` feature,
//! [`try_init`] installs an `env_logger` the first time a [`RegMark`]
//! instance is constructed, so embedders get output with zero setup. Hosts
//! that install their own `log` backend can disable the feature; the call
//! then compiles to a no-op and their backend receives our records instead.
//!
//! [`RegMark`]: crate::RegMark

use log::SetLoggerError;

/// Install the built-in `env_logger`, defaulting to `info` level when
/// `RUST_LOG` is unset. Fails if a logger is already registered, which
/// callers treat as benign.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}
