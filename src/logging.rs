//! Tracing subscriber setup.

use crate::error::{BubbleError, Result};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Map a verbosity count to a log level.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install a global formatting subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_for(verbosity))
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| BubbleError::LoggingError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(0), Level::WARN);
        assert_eq!(level_for(1), Level::INFO);
        assert_eq!(level_for(2), Level::DEBUG);
        assert_eq!(level_for(7), Level::TRACE);
    }

    #[test]
    fn test_second_init_fails() {
        // The first call may lose to another test binary's subscriber, the second never succeeds.
        let _ = init_logging(1);
        assert!(matches!(init_logging(1), Err(BubbleError::LoggingError(_))));
    }
}
