//! Replay-aware tracing macros for orchestration code.
//!
//! Orchestrations are re-executed on every turn, so plain `tracing` calls
//! would repeat on each replay. These macros emit only on polls where the
//! turn made progress, tagged with the instance and turn index.

/// Log at info level from inside an orchestration, once per real turn.
#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)*) => {
        if $ctx.is_logging_enabled() {
            ::tracing::info!(instance = %$ctx.instance_id(), turn = $ctx.turn_index(), $($arg)*);
        }
    };
}

/// Log at warn level from inside an orchestration, once per real turn.
#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)*) => {
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(instance = %$ctx.instance_id(), turn = $ctx.turn_index(), $($arg)*);
        }
    };
}

/// Log at error level from inside an orchestration, once per real turn.
#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)*) => {
        if $ctx.is_logging_enabled() {
            ::tracing::error!(instance = %$ctx.instance_id(), turn = $ctx.turn_index(), $($arg)*);
        }
    };
}
