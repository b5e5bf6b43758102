//! Log channels and subscriber setup
//!
//! Every event is emitted inside a span naming its channel, so one transfer
//! can be followed across components:
//!
//! - `outgoing`: traffic towards transfer agents
//! - `incoming`: status reports coming back from them
//! - `internal`: queue, scheduler and lifecycle decisions
//!
//! Each channel macro takes an optional `level = LEVEL,` prefix and
//! defaults to `TRACE`.

use std::io::IsTerminal;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Only events from these targets reach the subscriber
const TARGET_PREFIX: &str = "missive";

#[doc(hidden)]
#[macro_export]
macro_rules! channel {
    ($channel:literal, level = $level:ident, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($crate::tracing::Level::$level, $channel);
        let _enter = span.enter();

        $crate::tracing::event!($crate::tracing::Level::$level, $($msg),*)
    }};

    ($channel:literal, $($msg:expr),*) => {
        $crate::channel!($channel, level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! outgoing {
    ($($args:tt)*) => { $crate::channel!("outgoing", $($args)*) };
}

#[macro_export]
macro_rules! incoming {
    ($($args:tt)*) => { $crate::channel!("incoming", $($args)*) };
}

#[macro_export]
macro_rules! internal {
    ($($args:tt)*) => { $crate::channel!("internal", $($args)*) };
}

/// Level requested through `LOG_LEVEL`, falling back to `default` when it
/// is unset or unreadable
fn level_filter(requested: Option<&str>, default: LevelFilter) -> LevelFilter {
    let Some(requested) = requested else {
        return default;
    };

    requested.parse().unwrap_or_else(|_| {
        eprintln!("Ignoring LOG_LEVEL={requested}, using {default}");
        default
    })
}

/// Install the global subscriber. Debug builds default to `TRACE`, release
/// builds to `INFO`; colour is only used on a terminal.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    let requested = std::env::var("LOG_LEVEL").ok();

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(std::io::stderr)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level_filter(requested.as_deref(), default))
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with(TARGET_PREFIX)
                })),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_comes_from_request_or_default() {
        assert_eq!(level_filter(None, LevelFilter::INFO), LevelFilter::INFO);
        assert_eq!(level_filter(Some("debug"), LevelFilter::INFO), LevelFilter::DEBUG);
        assert_eq!(level_filter(Some("WARN"), LevelFilter::INFO), LevelFilter::WARN);
        assert_eq!(level_filter(Some("loud"), LevelFilter::INFO), LevelFilter::INFO);
    }

    #[test]
    fn channel_macros_accept_both_forms() {
        crate::internal!("plain {}", 1);
        crate::outgoing!(level = DEBUG, "with level {}", 2);
        crate::incoming!(level = WARN, "no args");
    }
}
