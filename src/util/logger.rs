//! This module provides a built-in logger implementation.
//!
//! The built-in logger uses the `env_logger` crate and is enabled by the
//! Cargo feature "builtin_env_logger" (on by default). When enabled, it is
//! initialized in [`crate::memory_manager::gc_init`] and shows logs of level
//! INFO or lower. Bindings that integrate with an existing logging framework
//! can disable the feature and register their own `log` implementation.

/// Attempt to init the built-in env_logger.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("Riptide initialized the logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` can only mean a logger was
                    // already registered, which is fine.
                    debug!("Riptide failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("Riptide didn't initialize the built-in env_logger. The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
