use {
    std::{io::IsTerminal, panic::PanicHookInfo, sync::Once},
    time::macros::format_description,
    tracing::level_filters::LevelFilter,
    tracing_subscriber::{
        EnvFilter,
        Layer,
        fmt::{time::UtcTime, writer::MakeWriterExt as _},
        prelude::*,
        util::SubscriberInitExt,
    },
};

/// Initializes the tracing setup shared between binaries.
///
/// `env_filter` uses the `EnvFilter` directive syntax, e.g.
/// `"warn,pool_cache=debug"`. `stderr_threshold` decides which events are
/// written to stderr instead of stdout.
pub fn initialize(env_filter: &str, stderr_threshold: LevelFilter) {
    set_tracing_subscriber(env_filter, stderr_threshold);
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

/// Like [`initialize`], but can be called multiple times in a row. Later calls
/// are ignored.
///
/// Useful for tests.
pub fn initialize_reentrant(env_filter: &str) {
    // The subscriber is a global object so initializing it again in the same
    // process from a different test would fail.
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        set_tracing_subscriber(env_filter, LevelFilter::ERROR);
        std::panic::set_hook(Box::new(tracing_panic_hook));
    });
}

fn set_tracing_subscriber(env_filter: &str, stderr_threshold: LevelFilter) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(
            std::io::stdout
                .with_min_level(
                    stderr_threshold
                        .into_level()
                        .unwrap_or(tracing::Level::ERROR),
                )
                .or_else(std::io::stderr),
        )
        .with_timer(UtcTime::new(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
        )))
        .with_ansi(std::io::stdout().is_terminal())
        .with_filter(EnvFilter::new(env_filter));

    // `try_init` so a subscriber installed by the embedding application wins.
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!(%env_filter, "initialized tracing");
    }
}

/// Panic hook that prints roughly the same message as the default panic hook
/// but uses `tracing::error` instead of stderr so panics keep the log format.
fn tracing_panic_hook(panic: &PanicHookInfo) {
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::force_capture();
    tracing::error!("thread '{name}' {panic}\nstack backtrace:\n{backtrace}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_global_subscriber_once() {
        initialize("info", LevelFilter::WARN);
        assert!(tracing::dispatcher::has_been_set());

        // A subscriber is already installed so this must not panic.
        initialize_reentrant("debug");
        tracing::debug!("still logging");
    }
}
