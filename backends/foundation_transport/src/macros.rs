// Logging macros that route to tracing only when the matching `log_*` feature is
// enabled, so release builds without them carry no logging at all.

macro_rules! info {
    ($($t:tt)*) => {
        if cfg!(feature = "log_info") {
            tracing::info!($($t)*);
        }
    };
}

macro_rules! warn {
    ($($t:tt)*) => {
        if cfg!(feature = "log_warnings") {
            tracing::warn!($($t)*);
        }
    };
}

macro_rules! debug {
    ($($t:tt)*) => {
        if cfg!(feature = "log_debug") {
            tracing::debug!($($t)*);
        }
    };
}

macro_rules! error {
    ($($t:tt)*) => {
        if cfg!(feature = "log_errors") {
            tracing::error!($($t)*);
        }
    };
}
