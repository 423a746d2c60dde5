#![warn(clippy::all, rust_2018_idioms)]

/// Location-prefixed logging macros.
///
/// Every message is prefixed with `[file:module:line]` so operation audit trails in
/// `dbfleet.log` can be traced back to the emitting call site without enabling
/// span output on the subscriber.
#[macro_export]
macro_rules! fleet_log {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!(
            "[{}:{}:{}] {}",
            file!(),
            module_path!(),
            line!(),
            format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::fleet_log!(debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::fleet_log!(info, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::fleet_log!(warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::fleet_log!(error, $($arg)*)
    };
}
