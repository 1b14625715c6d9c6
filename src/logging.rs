//! Process-wide logger setup

use slog::{Drain, Level, LevelFilter, o};
use slog_scope::GlobalLoggerGuard;

/// Installs an asynchronous terminal logger writing to stderr as the global
/// `slog_scope` logger.
///
/// Stdout stays untouched because a forked worker uses it to report to its
/// supervisor. Keep the returned guard alive for as long as the process
/// logs.
pub fn init(level: Level) -> GlobalLoggerGuard {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = LevelFilter::new(drain, level).fuse();

    slog_scope::set_global_logger(root_logger(drain))
}

/// Root logger over `drain`, tagging every record with this process's pid.
/// Records about a worker carry its pid as `worker_pid`.
pub(crate) fn root_logger<D>(drain: D) -> slog::Logger
where
    D: slog::SendSyncRefUnwindSafeDrain<Ok = (), Err = slog::Never> + 'static + std::panic::UnwindSafe,
{
    slog::Logger::root(drain, o!("pid" => std::process::id()))
}

/// Maps `-v`/`-q` counts onto a log level, starting from `Info`.
pub fn level_from_verbosity(verbose: u8, quiet: u8) -> Level {
    let index = Level::Info.as_usize() as i16 + verbose as i16 - quiet as i16;
    Level::from_usize(index.clamp(1, 6) as usize).unwrap_or(Level::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_from_verbosity(0, 0), Level::Info);
        assert_eq!(level_from_verbosity(1, 0), Level::Debug);
        assert_eq!(level_from_verbosity(5, 0), Level::Trace);
        assert_eq!(level_from_verbosity(0, 1), Level::Warning);
        assert_eq!(level_from_verbosity(0, 9), Level::Critical);
    }
}
