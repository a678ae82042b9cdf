// src/macros.rs

//
// Logging macros
//
// `logging` feature enabled  → tracing
// `logging` feature disabled → only log_error reaches stderr, the rest compile away
//
// The adapter, dispatcher and transports log through these so that no module
// names `tracing` directly.
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}

// --------------------
// WARN
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

// --------------------
// INFO
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

// --------------------
// DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
