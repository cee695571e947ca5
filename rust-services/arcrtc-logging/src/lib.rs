//! Structured logging setup for ArcRTC services

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize structured logging for ArcRTC services
///
/// This sets up:
/// - JSON formatted logs (for production)
/// - Environment-based log level filtering
/// - Service name tagging
pub fn init_logging(service_name: &str, default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    tracing::info!(
        service = service_name,
        "Logging initialized"
    );
}

/// Initialize simple console logging (for development)
///
/// This sets up:
/// - Human-readable formatted logs
/// - Environment-based log level filtering
pub fn init_console_logging(service_name: &str, default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        service = service_name,
        "Console logging initialized"
    );
}

/// Rate limiter for per-packet log sites.
///
/// Packet-path errors (malformed datagrams, auth failures) can arrive at line
/// rate; logging each one would saturate the log pipeline. A `LogLimiter`
/// grants at most `max_per_window` log events per window and counts the rest,
/// so the suppressed total can be reported when the window reopens.
#[derive(Debug)]
pub struct LogLimiter {
    inner: Mutex<LimiterState>,
    max_per_window: u32,
    window: Duration,
}

#[derive(Debug)]
struct LimiterState {
    window_start: Instant,
    granted: u32,
    suppressed: u64,
}

/// Outcome of a [`LogLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPermit {
    /// Caller may log. Carries the number of events suppressed since the
    /// last granted permit, so the log line can account for them.
    Granted { suppressed: u64 },
    /// Caller must not log this event.
    Suppressed,
}

impl LogLimiter {
    /// Create a limiter granting `max_per_window` events per `window`.
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        LogLimiter {
            inner: Mutex::new(LimiterState {
                window_start: Instant::now(),
                granted: 0,
                suppressed: 0,
            }),
            max_per_window,
            window,
        }
    }

    /// Limiter with the default budget for packet-path sites: 10 events/s.
    pub fn per_second() -> Self {
        Self::new(10, Duration::from_secs(1))
    }

    /// Ask for permission to log one event.
    pub fn check(&self) -> LogPermit {
        let mut state = match self.inner.lock() {
            Ok(guard) => guard,
            // A poisoned limiter must never take down the packet path.
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.granted = 0;
        }

        if state.granted < self.max_per_window {
            state.granted += 1;
            let suppressed = state.suppressed;
            state.suppressed = 0;
            LogPermit::Granted { suppressed }
        } else {
            state.suppressed += 1;
            LogPermit::Suppressed
        }
    }

    /// Total events suppressed and not yet reported via a granted permit.
    pub fn pending_suppressed(&self) -> u64 {
        match self.inner.lock() {
            Ok(state) => state.suppressed,
            Err(poisoned) => poisoned.into_inner().suppressed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_grants_up_to_budget() {
        let limiter = LogLimiter::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert_eq!(limiter.check(), LogPermit::Granted { suppressed: 0 });
        }
        assert_eq!(limiter.check(), LogPermit::Suppressed);
        assert_eq!(limiter.check(), LogPermit::Suppressed);
        assert_eq!(limiter.pending_suppressed(), 2);
    }

    #[test]
    fn test_limiter_reports_suppressed_after_window() {
        let limiter = LogLimiter::new(1, Duration::from_millis(10));

        assert_eq!(limiter.check(), LogPermit::Granted { suppressed: 0 });
        assert_eq!(limiter.check(), LogPermit::Suppressed);
        assert_eq!(limiter.check(), LogPermit::Suppressed);

        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(limiter.check(), LogPermit::Granted { suppressed: 2 });
        assert_eq!(limiter.pending_suppressed(), 0);
    }
}
